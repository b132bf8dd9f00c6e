//! Einlass - OAuth 2.0 / OpenID Connect client with PKCE
//!
//! This library implements the client side of the authorization code flow
//! with PKCE for native and command-line applications.
//!
//! # Features
//!
//! - Authorization code flow with PKCE (RFC 7636) and OIDC discovery
//! - State and nonce validation, ID token parsing
//! - Token exchange, refresh, revocation (RFC 7009) and end-session
//! - Pluggable token storage and a pluggable user agent
//! - Refresh de-duplication across tasks and, optionally, processes
//!
//! # Example
//!
//! ```
//! use einlass::prelude::*;
//!
//! # async fn run() -> einlass::error::Result<()> {
//! let config = ClientConfig::new("your-client-id")
//!     .with_authorization_endpoint("https://auth.example.com/authorize")
//!     .with_token_endpoint("https://auth.example.com/token")
//!     .with_redirect_uri("http://127.0.0.1:8080/callback")
//!     .with_scope("openid offline_access");
//!
//! let client = OidcClient::new(config)?;
//! let request = client.create_auth_code_request(&[]).await?;
//! println!("Authorization URL: {}", request.url);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod flow;
pub mod jwt;
pub mod lock;
pub mod pkce;
pub mod refresh;
pub mod request;
pub mod store;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callback::LoopbackUserAgent;
    pub use crate::client::OidcClient;
    pub use crate::config::ClientConfig;
    pub use crate::error::OAuthError;
    pub use crate::flow::{
        AuthCodeResult, CodeAuthFlow, EndSessionFlow, FlowState, UserAgent, UserAgentOutcome,
    };
    pub use crate::jwt::Jwt;
    pub use crate::lock::RefreshLockManager;
    pub use crate::pkce::{CodeChallengeMethod, Pkce};
    pub use crate::refresh::TokenRefreshHandler;
    pub use crate::request::{AuthCodeRequest, EndSessionRequest};
    pub use crate::store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};
    pub use crate::token::{AccessTokenResponse, OauthTokens};
}
