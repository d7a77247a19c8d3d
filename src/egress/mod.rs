//! Outbound HTTP gateway with a fixed host allow-list.
//!
//! All calls to the accounting platform go through [`EgressGateway::send`].
//! The target host is checked before any socket is opened, so a bad base URL
//! or an injected absolute URL can never carry tenant secrets elsewhere.
//! Redirects are held to the same allow-list hop by hop; a redirect to any
//! other host is not followed and the 3xx is handed back to the caller.

use crate::error::{IntegrationError, Result};
use crate::oauth::provider::{Environment, ALLOWED_HOSTS};
use reqwest::redirect::{Action, Attempt, Policy};
use reqwest::{Method, RequestBuilder, Response};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Correlation header the platform attaches to every response
pub const CORRELATION_HEADER: &str = "intuit_tid";

/// Default bound on every outbound call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 5;

pub struct EgressGateway {
    client: reqwest::Client,
    base_url: Url,
    allowed_hosts: Arc<HashSet<String>>,
    dispatched: AtomicU64,
}

impl EgressGateway {
    /// Creates a gateway for an explicit allow-list.
    ///
    /// Relative targets resolve against `base_url`.
    pub fn new<I, S>(base_url: &str, allowed_hosts: I, timeout: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let base_url = Url::parse(base_url).map_err(|e| {
            IntegrationError::Transport(format!("invalid egress base URL: {}", e))
        })?;

        let allowed_hosts: Arc<HashSet<String>> = Arc::new(
            allowed_hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        );

        let redirect_hosts = Arc::clone(&allowed_hosts);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::custom(move |attempt| {
                follow_if_allowed(attempt, &redirect_hosts)
            }))
            .build()
            .map_err(|e| IntegrationError::Transport(format!("failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            allowed_hosts,
            dispatched: AtomicU64::new(0),
        })
    }

    /// Gateway restricted to the platform's token, revocation and API hosts.
    pub fn for_platform(environment: Environment, timeout: Duration) -> Result<Self> {
        Self::new(environment.api_base_url(), ALLOWED_HOSTS.iter(), timeout)
    }

    /// Resolves `target` to an absolute URL and enforces the allow-list.
    pub fn resolve(&self, target: &str) -> Result<Url> {
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.base_url.join(target).map_err(|_| IntegrationError::HostNotAllowed {
                    host: "<unresolvable>".to_string(),
                })?
            }
            Err(_) => {
                return Err(IntegrationError::HostNotAllowed {
                    host: "<unparseable>".to_string(),
                })
            }
        };

        let host = url.host_str().map(str::to_ascii_lowercase).unwrap_or_default();

        if !is_allowed(&url, &self.allowed_hosts) {
            warn!(host = %host, scheme = %url.scheme(), "Blocked outbound request to disallowed host");
            return Err(IntegrationError::HostNotAllowed { host });
        }

        Ok(url)
    }

    /// Sends a request after the allow-list check.
    ///
    /// `build` customises the request (auth, body, headers). Non-2xx
    /// responses are returned as-is; callers decide what they mean.
    pub async fn send<F>(&self, method: Method, target: &str, build: F) -> Result<Response>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let url = self.resolve(target)?;
        let host = url.host_str().unwrap_or_default().to_string();
        let path = url.path().to_string();

        let request = build(self.client.request(method.clone(), url));
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        match request.send().await {
            Ok(response) => {
                let correlation_id = response
                    .headers()
                    .get(CORRELATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                let status = response.status();
                if status.is_success() {
                    debug!(
                        method = %method,
                        host = %host,
                        path = %path,
                        status = status.as_u16(),
                        intuit_tid = %correlation_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Platform call completed"
                    );
                } else {
                    warn!(
                        method = %method,
                        host = %host,
                        path = %path,
                        status = status.as_u16(),
                        intuit_tid = %correlation_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Platform call returned error status"
                    );
                }
                Ok(response)
            }
            Err(e) => {
                warn!(
                    method = %method,
                    host = %host,
                    path = %path,
                    timeout = e.is_timeout(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Platform call failed"
                );
                Err(IntegrationError::Transport(format!(
                    "request to {} failed{}",
                    host,
                    if e.is_timeout() { " (timeout)" } else { "" }
                )))
            }
        }
    }

    /// Number of requests that passed the allow-list and were dispatched.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

fn is_allowed(url: &Url, allowed_hosts: &HashSet<String>) -> bool {
    let scheme_ok = matches!(url.scheme(), "https" | "http");
    match url.host_str() {
        Some(host) if scheme_ok && !host.is_empty() => {
            allowed_hosts.contains(&host.to_ascii_lowercase())
        }
        _ => false,
    }
}

/// Redirect policy: follow only to allowed hosts, otherwise stop and return
/// the 3xx as the response.
fn follow_if_allowed(attempt: Attempt, allowed_hosts: &HashSet<String>) -> Action {
    if attempt.previous().len() > MAX_REDIRECTS {
        warn!(hops = attempt.previous().len(), "Too many redirects from platform, not following");
        return attempt.stop();
    }
    if !is_allowed(attempt.url(), allowed_hosts) {
        warn!(
            host = %attempt.url().host_str().unwrap_or_default(),
            "Blocked redirect to disallowed host"
        );
        return attempt.stop();
    }
    attempt.follow()
}

/// Reads a response body for server-side logging, capped to keep logs sane.
pub async fn body_excerpt(response: Response) -> String {
    const MAX_EXCERPT: usize = 512;
    let mut body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    if body.len() > MAX_EXCERPT {
        let mut cut = MAX_EXCERPT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> EgressGateway {
        EgressGateway::for_platform(Environment::Sandbox, DEFAULT_TIMEOUT).unwrap()
    }

    #[test]
    fn test_relative_targets_resolve_against_base() {
        let url = gateway().resolve("v3/company/123/companyinfo/123").unwrap();
        assert_eq!(url.host_str(), Some("sandbox-quickbooks.api.intuit.com"));
        assert_eq!(url.path(), "/v3/company/123/companyinfo/123");
    }

    #[test]
    fn test_absolute_allowed_targets_pass() {
        let gateway = gateway();
        assert!(gateway
            .resolve("https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer")
            .is_ok());
        assert!(gateway
            .resolve("https://DEVELOPER.api.intuit.com/v2/oauth2/tokens/revoke")
            .is_ok());
    }

    #[test]
    fn test_disallowed_hosts_rejected() {
        let gateway = gateway();
        for target in [
            "https://evil.example.com/steal",
            "//evil.example.com/steal",
            "https://oauth.platform.intuit.com.evil.example.com/",
            "ftp://oauth.platform.intuit.com/",
            "file:///etc/passwd",
        ] {
            assert!(
                matches!(
                    gateway.resolve(target),
                    Err(IntegrationError::HostNotAllowed { .. })
                ),
                "{} should be rejected",
                target
            );
        }
    }

    #[tokio::test]
    async fn test_rejected_call_opens_no_connection() {
        let gateway = gateway();

        let result = gateway
            .send(Method::POST, "https://evil.example.com/token", |r| {
                r.basic_auth("client", Some("secret"))
            })
            .await;

        assert!(matches!(
            result,
            Err(IntegrationError::HostNotAllowed { ref host }) if host == "evil.example.com"
        ));
        assert_eq!(gateway.dispatched(), 0);
    }

    #[tokio::test]
    async fn test_redirect_to_disallowed_host_not_followed() {
        let mut server = mockito::Server::new_async().await;
        let port = server.socket_address().port();
        let token = server
            .mock("POST", "/token")
            .with_status(307)
            .with_header("location", &format!("http://localhost:{}/steal", port))
            .expect(1)
            .create_async()
            .await;
        let stolen = server
            .mock("POST", "/steal")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let gateway = EgressGateway::new(&server.url(), ["127.0.0.1"], DEFAULT_TIMEOUT).unwrap();
        let response = gateway
            .send(Method::POST, "/token", |r| {
                r.form(&[("refresh_token", "secret-refresh")])
            })
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 307);
        token.assert_async().await;
        stolen.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirect_within_allowed_hosts_followed() {
        let mut server = mockito::Server::new_async().await;
        let moved = server
            .mock("GET", "/old")
            .with_status(308)
            .with_header("location", &format!("{}/new", server.url()))
            .create_async()
            .await;
        let target = server
            .mock("GET", "/new")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let gateway = EgressGateway::new(&server.url(), ["127.0.0.1"], DEFAULT_TIMEOUT).unwrap();
        let response = gateway.send(Method::GET, "/old", |r| r).await.unwrap();

        assert_eq!(response.status().as_u16(), 200);
        moved.assert_async().await;
        target.assert_async().await;
    }
}
