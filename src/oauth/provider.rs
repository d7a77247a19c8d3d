//! Accounting platform endpoints.
//!
//! One platform, two environments. The token and revocation endpoints are
//! shared; the API host depends on the environment.

use serde::{Deserialize, Serialize};

pub const AUTHORIZATION_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
pub const TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
pub const REVOCATION_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
pub const SANDBOX_API_URL: &str = "https://sandbox-quickbooks.api.intuit.com/";
pub const PRODUCTION_API_URL: &str = "https://quickbooks.api.intuit.com/";
pub const DEFAULT_SCOPE: &str = "com.intuit.quickbooks.accounting";

/// Hostnames the egress gateway may contact.
pub const ALLOWED_HOSTS: &[&str] = &[
    "oauth.platform.intuit.com",
    "developer.api.intuit.com",
    "sandbox-quickbooks.api.intuit.com",
    "quickbooks.api.intuit.com",
];

/// Platform environment selector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn api_base_url(self) -> &'static str {
        match self {
            Environment::Sandbox => SANDBOX_API_URL,
            Environment::Production => PRODUCTION_API_URL,
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "development" => Ok(Environment::Sandbox),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// Endpoints used by the OAuth flows.
///
/// Defaults point at the real platform. Overrides must still pass the
/// egress allow-list, so a mistyped endpoint fails closed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformEndpoints {
    pub authorization_url: String,
    pub token_url: String,
    pub revocation_url: String,
    pub api_base_url: String,
}

impl PlatformEndpoints {
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            authorization_url: AUTHORIZATION_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            revocation_url: REVOCATION_URL.to_string(),
            api_base_url: environment.api_base_url().to_string(),
        }
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(
        &self,
        client_id: &str,
        scope: &str,
        redirect_uri: &str,
        state: &str,
    ) -> String {
        format!(
            "{}?client_id={}&response_type=code&scope={}&redirect_uri={}&state={}",
            self.authorization_url,
            urlencoding::encode(client_id),
            urlencoding::encode(scope),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("sandbox".parse(), Ok(Environment::Sandbox));
        assert_eq!(" Production ".parse(), Ok(Environment::Production));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_endpoints_per_environment() {
        let sandbox = PlatformEndpoints::for_environment(Environment::Sandbox);
        let production = PlatformEndpoints::for_environment(Environment::Production);

        assert_eq!(sandbox.token_url, production.token_url);
        assert!(sandbox.api_base_url.contains("sandbox-quickbooks"));
        assert!(!production.api_base_url.contains("sandbox"));
    }

    #[test]
    fn test_default_endpoints_are_allowed() {
        for environment in [Environment::Sandbox, Environment::Production] {
            let endpoints = PlatformEndpoints::for_environment(environment);
            for url in [
                &endpoints.token_url,
                &endpoints.revocation_url,
                &endpoints.api_base_url,
            ] {
                let host = url::Url::parse(url).unwrap().host_str().unwrap().to_string();
                assert!(ALLOWED_HOSTS.contains(&host.as_str()), "{} not allowed", host);
            }
        }
    }

    #[test]
    fn test_build_auth_url() {
        let endpoints = PlatformEndpoints::for_environment(Environment::Sandbox);
        let url = endpoints.build_auth_url(
            "client 1",
            DEFAULT_SCOPE,
            "http://localhost:3000/callback",
            "data.sig",
        );

        assert!(url.starts_with(AUTHORIZATION_URL));
        assert!(url.contains("client_id=client%201"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=com.intuit.quickbooks.accounting"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));
        assert!(url.contains("state=data.sig"));
    }
}
