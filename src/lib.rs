// Credential encryption and connection persistence
pub mod credentials;

// OAuth 2.0 protocol: state signing, nonces, grants
pub mod oauth;

// Outbound HTTP allow-list
pub mod egress;

// Company → tenant resolution
pub mod tenant;

// Caller authentication
pub mod auth;

// Access token refresh and rotation
pub mod token;

// Connect / callback / status / disconnect orchestration
pub mod connection;

// HTTP API
pub mod api;

// Configuration (TOML + environment)
pub mod config;

pub mod error;
