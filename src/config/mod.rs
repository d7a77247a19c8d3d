use crate::oauth::{Environment, PlatformEndpoints};
use crate::oauth::provider::DEFAULT_SCOPE;
use serde::Deserialize;
use std::collections::HashMap;

/// Complete ledgerlink configuration.
///
/// Loaded from `ledgerlink.toml`, then overlaid with `LEDGERLINK_*`
/// environment variables. Secret-bearing sections do not implement `Debug`.
#[derive(Clone, Default, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// OAuth client registration
#[derive(Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub environment: Environment,
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/api/integrations/accounting/callback".to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
            environment: Environment::default(),
        }
    }
}

/// Keys protecting stored credentials and the OAuth state parameter
#[derive(Clone, Deserialize)]
pub struct SecurityConfig {
    /// Base64 encoded 32-byte AES key
    pub encryption_key: Option<String>,
    pub state_signing_secret: Option<String>,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
}

fn default_state_ttl() -> i64 {
    600
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            state_signing_secret: None,
            state_ttl_seconds: default_state_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Refresh when the access token expires within this many seconds
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_seconds: i64,
}

fn default_refresh_buffer() -> i64 {
    crate::token::DEFAULT_REFRESH_BUFFER_SECONDS
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_seconds: default_refresh_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_egress_timeout")]
    pub timeout_seconds: u64,
}

fn default_egress_timeout() -> u64 {
    crate::egress::DEFAULT_TIMEOUT.as_secs()
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_egress_timeout(),
        }
    }
}

/// Platform API options and endpoint overrides.
///
/// Overrides are still subject to the egress allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
    pub revocation_url: Option<String>,
    pub api_base_url: Option<String>,
}

fn default_minor_version() -> u32 {
    75
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            minor_version: default_minor_version(),
            authorization_url: None,
            token_url: None,
            revocation_url: None,
            api_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_frontend_url")]
    pub base_url: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec![default_frontend_url()]
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            base_url: default_frontend_url(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "ledgerlink.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often consumed OAuth nonces are purged (seconds)
    #[serde(default = "default_nonce_cleanup_interval")]
    pub nonce_cleanup_interval_seconds: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_nonce_cleanup_interval() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            nonce_cleanup_interval_seconds: default_nonce_cleanup_interval(),
        }
    }
}

impl ServerConfig {
    /// Cleanup period in seconds, never zero.
    pub fn nonce_cleanup_interval(&self) -> u64 {
        self.nonce_cleanup_interval_seconds.max(1)
    }
}

/// Caller authentication
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    /// API key → caller identity
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyConfig>,
}

fn default_auth_enabled() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            api_keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ApiKeyConfig {
    pub company_id: i64,
    #[serde(default)]
    pub admin: bool,
}

impl IntegrationConfig {
    /// Overlays `LEDGERLINK_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overlays values from `lookup`, falling back to what is already set.
    ///
    /// Unparseable numeric or boolean values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LEDGERLINK_CLIENT_ID") {
            self.oauth.client_id = Some(v);
        }
        if let Some(v) = get("LEDGERLINK_CLIENT_SECRET") {
            self.oauth.client_secret = Some(v);
        }
        if let Some(v) = get("LEDGERLINK_REDIRECT_URI") {
            self.oauth.redirect_uri = v;
        }
        if let Some(v) = get("LEDGERLINK_SCOPE") {
            self.oauth.scope = v;
        }
        if let Some(v) = get("LEDGERLINK_ENVIRONMENT") {
            match v.parse() {
                Ok(env) => self.oauth.environment = env,
                Err(e) => tracing::warn!(error = %e, "Ignoring LEDGERLINK_ENVIRONMENT"),
            }
        }
        if let Some(v) = get("LEDGERLINK_ENCRYPTION_KEY") {
            self.security.encryption_key = Some(v);
        }
        if let Some(v) = get("LEDGERLINK_STATE_SIGNING_SECRET") {
            self.security.state_signing_secret = Some(v);
        }
        if let Some(n) = get("LEDGERLINK_STATE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.security.state_ttl_seconds = n;
        }
        if let Some(n) = get("LEDGERLINK_REFRESH_BUFFER_SECONDS").and_then(|v| v.parse().ok()) {
            self.token.refresh_buffer_seconds = n;
        }
        if let Some(n) = get("LEDGERLINK_EGRESS_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.egress.timeout_seconds = n;
        }
        if let Some(n) = get("LEDGERLINK_MINOR_VERSION").and_then(|v| v.parse().ok()) {
            self.platform.minor_version = n;
        }
        if let Some(v) = get("LEDGERLINK_FRONTEND_URL") {
            self.frontend.base_url = v;
        }
        if let Some(v) = get("LEDGERLINK_ALLOWED_ORIGINS") {
            self.frontend.allowed_origins = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(v) = get("LEDGERLINK_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(n) = get("LEDGERLINK_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = n;
        }
        if let Some(b) = get("LEDGERLINK_AUTH_ENABLED").and_then(|v| v.parse().ok()) {
            self.auth.enabled = b;
        }
    }

    /// Platform endpoints for the configured environment, with overrides.
    pub fn platform_endpoints(&self) -> PlatformEndpoints {
        let mut endpoints = PlatformEndpoints::for_environment(self.oauth.environment);
        if let Some(url) = &self.platform.authorization_url {
            endpoints.authorization_url = url.clone();
        }
        if let Some(url) = &self.platform.token_url {
            endpoints.token_url = url.clone();
        }
        if let Some(url) = &self.platform.revocation_url {
            endpoints.revocation_url = url.clone();
        }
        if let Some(url) = &self.platform.api_base_url {
            endpoints.api_base_url = url.clone();
        }
        endpoints
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<IntegrationConfig> {
    use anyhow::Context;

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let config: IntegrationConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IntegrationConfig::default();
        assert_eq!(config.oauth.scope, "com.intuit.quickbooks.accounting");
        assert_eq!(config.oauth.environment, Environment::Sandbox);
        assert_eq!(config.security.state_ttl_seconds, 600);
        assert_eq!(config.token.refresh_buffer_seconds, 300);
        assert_eq!(config.egress.timeout_seconds, 30);
        assert_eq!(config.server.port, 3000);
        assert!(config.auth.enabled);
        assert!(config.security.encryption_key.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [oauth]
            client_id = "abc"
            client_secret = "shh"
            environment = "production"

            [security]
            encryption_key = "a2V5"
            state_ttl_seconds = 300

            [platform]
            minor_version = 70

            [frontend]
            base_url = "https://app.example.com"
            allowed_origins = ["https://app.example.com"]

            [auth.api_keys.k1]
            company_id = 12
            admin = true

            [auth.api_keys.k2]
            company_id = 13
        "#;

        let config: IntegrationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.oauth.client_id.as_deref(), Some("abc"));
        assert_eq!(config.oauth.environment, Environment::Production);
        assert_eq!(config.security.state_ttl_seconds, 300);
        assert_eq!(config.platform.minor_version, 70);
        assert_eq!(config.frontend.base_url, "https://app.example.com");
        assert!(config.auth.api_keys["k1"].admin);
        assert!(!config.auth.api_keys["k2"].admin);
        assert_eq!(config.auth.api_keys["k2"].company_id, 13);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [token]
            refresh_buffer_seconds = 120
        "#;

        let config: IntegrationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.token.refresh_buffer_seconds, 120);
        assert_eq!(config.security.state_ttl_seconds, 600); // Default
        assert_eq!(config.storage.database_path, "ledgerlink.db"); // Default
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEDGERLINK_CLIENT_ID", "env-client"),
            ("LEDGERLINK_ENVIRONMENT", "production"),
            ("LEDGERLINK_PORT", "8080"),
            ("LEDGERLINK_REFRESH_BUFFER_SECONDS", "not-a-number"),
            ("LEDGERLINK_ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("LEDGERLINK_AUTH_ENABLED", "false"),
            ("LEDGERLINK_CLIENT_SECRET", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = IntegrationConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.oauth.client_id.as_deref(), Some("env-client"));
        assert_eq!(config.oauth.environment, Environment::Production);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.token.refresh_buffer_seconds, 300);
        assert_eq!(
            config.frontend.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert!(!config.auth.enabled);
        assert!(config.oauth.client_secret.is_none());
    }

    #[test]
    fn test_zero_nonce_cleanup_interval_is_clamped() {
        let toml = r#"
            [server]
            nonce_cleanup_interval_seconds = 0
        "#;

        let config: IntegrationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.nonce_cleanup_interval(), 1);
        assert_eq!(IntegrationConfig::default().server.nonce_cleanup_interval(), 60);
    }

    #[test]
    fn test_platform_endpoint_overrides() {
        let mut config = IntegrationConfig::default();
        config.platform.token_url = Some("http://127.0.0.1:9/token".to_string());

        let endpoints = config.platform_endpoints();
        assert_eq!(endpoints.token_url, "http://127.0.0.1:9/token");
        assert_eq!(
            endpoints.api_base_url,
            "https://sandbox-quickbooks.api.intuit.com/"
        );
    }
}
