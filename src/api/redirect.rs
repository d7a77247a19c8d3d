//! Frontend redirect targets.
//!
//! The OAuth callback ends with a browser redirect back to the frontend.
//! The configured base URL is checked against the origin allow-list every
//! time, so a bad deployment value can never turn the callback into an open
//! redirect.

use tracing::warn;
use url::Url;

const PROFILE_PATH: &str = "/business-profile";

#[derive(Clone, Debug)]
pub struct FrontendRedirect {
    base_url: String,
    allowed_origins: Vec<String>,
}

impl FrontendRedirect {
    pub fn new(base_url: &str, allowed_origins: &[String]) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            allowed_origins: allowed_origins.iter().filter_map(|o| origin_of(o)).collect(),
        }
    }

    /// Base URL if its origin is allowed, else the first allowed origin.
    ///
    /// Empty when nothing is allowed, which yields a same-origin redirect.
    pub fn base(&self) -> String {
        match origin_of(&self.base_url) {
            Some(origin) if self.allowed_origins.contains(&origin) => self.base_url.clone(),
            _ => {
                warn!(base_url = %self.base_url, "Frontend URL not in allowed origins, using fallback");
                self.allowed_origins.first().cloned().unwrap_or_default()
            }
        }
    }

    pub fn success_url(&self) -> String {
        format!("{}{}?status=success", self.base(), PROFILE_PATH)
    }

    pub fn error_url(&self, reason: &str) -> String {
        format!(
            "{}{}?status=error&message={}",
            self.base(),
            PROFILE_PATH,
            urlencoding::encode(reason)
        )
    }
}

/// `scheme://host[:port]` for http(s) URLs.
fn origin_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    Some(url.origin().ascii_serialization())
}
