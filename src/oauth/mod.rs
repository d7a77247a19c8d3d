//! OAuth 2.0 protocol pieces for the accounting platform.
//!
//! Implements the authorization code flow:
//! 1. Caller requests the authorize endpoint
//! 2. A signed state (`tenantId`, nonce, issue time) is attached to the provider URL
//! 3. User authorizes on the provider's site
//! 4. Provider redirects back with `code`, `realmId` and `state`
//! 5. State is verified, its nonce consumed, the code exchanged for tokens
//! 6. Tokens are refreshed (and rotated) for the rest of the connection's life

pub mod exchange;
pub mod nonce;
pub mod provider;
pub mod state;

pub use exchange::{ClientCredentials, TokenGrant};
pub use nonce::{run_nonce_cleanup, NonceCache};
pub use provider::{Environment, PlatformEndpoints};
pub use state::{OAuthStatePayload, StateCodec};
