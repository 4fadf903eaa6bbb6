//! # tether-auth
//!
//! Credential lifecycle for one agent identity.
//!
//! - [`TokenStore`]: atomic, timestamped token files in a per-agent directory
//! - [`AuthSession`]: single-flight refresh ahead of expiry, authorization fallback
//! - [`oauth`]: token endpoint calls (refresh, code exchange, authorization URL)
//! - [`pkce`]: S256 verifier/challenge generation
//!
//! The session is constructed with an explicit store; nothing here touches a
//! process-wide token directory.

#![deny(unsafe_code)]

pub mod errors;
pub mod oauth;
pub mod pkce;
pub mod session;
pub mod storage;
pub mod types;

pub use errors::AuthError;
pub use pkce::{PkcePair, generate_pkce};
pub use session::{AuthSession, AuthorizationGrant, AuthorizationRequest, Authorizer};
pub use storage::TokenStore;
pub use types::{Credential, OAuthConfig, TokenResponse};
