//! Authorization code and end-session flows
//!
//! A flow drives one login or logout attempt through its states in order:
//! resolve the configuration, build the request, hand the URL to a
//! [`UserAgent`], validate what comes back and, for login, exchange the code.
//! The user agent is the only platform specific piece; it may be a system
//! browser with a loopback listener, an embedded web view or a native
//! authentication session.

use crate::client::OidcClient;
use crate::error::{OAuthError, Result};
use crate::jwt::Jwt;
use crate::request::AuthCodeRequest;
use crate::token::AccessTokenResponse;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default upper bound on waiting for the post-logout redirect
pub const DEFAULT_END_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// What the user agent reports after showing a URL to the user
#[derive(Debug)]
pub enum UserAgentOutcome {
    /// The agent reached a URL starting with the expected redirect URI
    Redirect(Url),
    /// The user closed the browser or aborted the session
    Cancelled,
    /// The agent itself failed
    Failed(OAuthError),
}

/// Shows a URL to the user and reports where the browser ended up
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Open `url` and wait until the browser is redirected to a URL that
    /// starts with `redirect_uri`, the user cancels, or the agent fails.
    async fn open(&self, url: &Url, redirect_uri: &str) -> UserAgentOutcome;
}

#[async_trait]
impl<A: UserAgent + ?Sized> UserAgent for Arc<A> {
    async fn open(&self, url: &Url, redirect_uri: &str) -> UserAgentOutcome {
        (**self).open(url, redirect_uri).await
    }
}

/// Parameters of the authorization redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCodeResult {
    Code {
        code: Option<String>,
        state: Option<String>,
    },
    Error {
        error: String,
        error_description: Option<String>,
        state: Option<String>,
    },
    Cancelled,
}

impl AuthCodeResult {
    /// Read `code`/`state` or `error` from a redirect URL's query
    pub fn from_redirect_url(url: &Url) -> Self {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let state = params.get("state").cloned();

        match params.get("error") {
            Some(error) => Self::Error {
                error: error.clone(),
                error_description: params.get("error_description").cloned(),
                state,
            },
            None => Self::Code {
                code: params.get("code").cloned(),
                state,
            },
        }
    }
}

/// Progress of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    RequestBuilt,
    AwaitingExternalResult,
    CodeReceived,
    Exchanging,
    Completed,
    Failed,
}

#[derive(Debug)]
struct StateTracker(Mutex<FlowState>);

impl StateTracker {
    fn new() -> Self {
        Self(Mutex::new(FlowState::Idle))
    }

    fn get(&self) -> FlowState {
        *self.0.lock()
    }

    fn set(&self, state: FlowState) {
        debug!(?state, "Flow transition");
        *self.0.lock() = state;
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.set(FlowState::Completed),
            Err(e) => {
                warn!(error = %e, "Flow failed");
                self.set(FlowState::Failed);
            }
        }
        result
    }
}

/// Authorization code flow with PKCE
///
/// # Example
///
/// ```no_run
/// use einlass::prelude::*;
/// use std::sync::Arc;
///
/// # async fn run() -> einlass::error::Result<()> {
/// let agent = LoopbackUserAgent::bind(8080).await?;
/// let config = ClientConfig::new("my-client")
///     .with_issuer("https://idp.example.com")
///     .with_redirect_uri(agent.redirect_uri())
///     .with_scope("openid profile offline_access");
///
/// let client = Arc::new(OidcClient::new(config)?);
/// let flow = CodeAuthFlow::new(client, agent);
/// let tokens = flow.get_access_token().await?;
///
/// let store = MemoryTokenStore::new();
/// store.save_tokens(&tokens);
/// # Ok(())
/// # }
/// ```
pub struct CodeAuthFlow<A: UserAgent> {
    client: Arc<OidcClient>,
    user_agent: A,
    state: StateTracker,
}

impl<A: UserAgent> CodeAuthFlow<A> {
    pub fn new(client: Arc<OidcClient>, user_agent: A) -> Self {
        Self {
            client,
            user_agent,
            state: StateTracker::new(),
        }
    }

    /// Current state of the most recent run
    pub fn state(&self) -> FlowState {
        self.state.get()
    }

    /// Run the whole login flow and return the token response
    pub async fn get_access_token(&self) -> Result<AccessTokenResponse> {
        self.get_access_token_with(&[]).await
    }

    /// Run the whole login flow with extra authorization parameters
    pub async fn get_access_token_with(
        &self,
        extra_params: &[(&str, &str)],
    ) -> Result<AccessTokenResponse> {
        let request = self.start_login(extra_params).await?;
        let result = match self.await_result(&request).await {
            Ok(result) => result,
            Err(e) => return self.state.track(Err(e)),
        };
        self.continue_login(&request, result).await
    }

    /// Resolve the configuration and build the authorization request
    ///
    /// Callers that cannot keep the process alive while the browser is open
    /// persist the returned request and later call
    /// [`continue_login`](Self::continue_login) with it. The client secret is
    /// left out of the persisted form and taken from the client instead.
    pub async fn start_login(&self, extra_params: &[(&str, &str)]) -> Result<AuthCodeRequest> {
        self.state.set(FlowState::Idle);
        let request = self.client.create_auth_code_request(extra_params).await;
        match request {
            Ok(request) => {
                self.state.set(FlowState::RequestBuilt);
                Ok(request)
            }
            Err(e) => self.state.track(Err(e)),
        }
    }

    async fn await_result(&self, request: &AuthCodeRequest) -> Result<AuthCodeResult> {
        let redirect_uri = request.config.redirect_uri.as_deref().ok_or_else(|| {
            OAuthError::InvalidConfiguration(
                "redirect_uri is required to receive the authorization code".to_string(),
            )
        })?;
        self.state.set(FlowState::AwaitingExternalResult);

        let result = match self.user_agent.open(&request.url, redirect_uri).await {
            UserAgentOutcome::Redirect(url) if url.as_str().starts_with(redirect_uri) => {
                AuthCodeResult::from_redirect_url(&url)
            }
            UserAgentOutcome::Redirect(_) => {
                return Err(OAuthError::AuthenticationFailure(
                    "Login redirected to an unexpected URI".to_string(),
                ))
            }
            UserAgentOutcome::Cancelled => AuthCodeResult::Cancelled,
            UserAgentOutcome::Failed(e) => AuthCodeResult::Error {
                error: "user_agent_failure".to_string(),
                error_description: Some(e.to_string()),
                state: None,
            },
        };
        Ok(result)
    }

    /// Validate the redirect result and exchange the code for tokens
    pub async fn continue_login(
        &self,
        request: &AuthCodeRequest,
        result: AuthCodeResult,
    ) -> Result<AccessTokenResponse> {
        let outcome = self.exchange(request, result).await;
        self.state.track(outcome)
    }

    async fn exchange(
        &self,
        request: &AuthCodeRequest,
        result: AuthCodeResult,
    ) -> Result<AccessTokenResponse> {
        let (code, state) = match result {
            AuthCodeResult::Code { code, state } => (code, state),
            AuthCodeResult::Cancelled => {
                return Err(OAuthError::AuthenticationCancelled(
                    "Authentication cancelled by user".to_string(),
                ))
            }
            AuthCodeResult::Error {
                error,
                error_description,
                ..
            } => {
                let message = match error_description {
                    Some(description) => format!("{}: {}", error, description),
                    None => error,
                };
                return Err(OAuthError::AuthenticationFailure(message));
            }
        };

        self.state.set(FlowState::CodeReceived);
        let code =
            code.ok_or_else(|| OAuthError::AuthenticationFailure("No auth code".to_string()))?;
        if !state.is_some_and(|state| request.validate_state(&state)) {
            return Err(OAuthError::AuthenticationFailure("Invalid state".to_string()));
        }

        self.state.set(FlowState::Exchanging);
        let response = self.client.exchange_token(request, &code).await?;

        if let Some(id_token) = &response.id_token {
            let nonce = Jwt::parse(id_token)?.payload.nonce.unwrap_or_default();
            if !request.validate_nonce(&nonce) {
                return Err(OAuthError::AuthenticationFailure("Invalid nonce".to_string()));
            }
        }

        info!("Authorization code exchanged for tokens");
        Ok(response)
    }
}

/// Logout flow against the end-session endpoint
///
/// With a `post_logout_redirect_uri` configured the end-session URL is shown
/// in the user agent and the flow completes once the browser reaches that
/// URI. Without one the endpoint is called directly with the ID token hint.
pub struct EndSessionFlow<A: UserAgent> {
    client: Arc<OidcClient>,
    user_agent: A,
    timeout: Duration,
    state: StateTracker,
}

impl<A: UserAgent> EndSessionFlow<A> {
    pub fn new(client: Arc<OidcClient>, user_agent: A) -> Self {
        Self {
            client,
            user_agent,
            timeout: DEFAULT_END_SESSION_TIMEOUT,
            state: StateTracker::new(),
        }
    }

    /// Bound the wait for the post-logout redirect
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> FlowState {
        self.state.get()
    }

    /// End the session at the identity provider
    pub async fn end_session(&self, id_token: Option<&str>) -> Result<()> {
        self.end_session_with(id_token, &[]).await
    }

    pub async fn end_session_with(
        &self,
        id_token: Option<&str>,
        extra_params: &[(&str, &str)],
    ) -> Result<()> {
        self.state.set(FlowState::Idle);
        let outcome = self.run(id_token, extra_params).await;
        self.state.track(outcome)
    }

    async fn run(&self, id_token: Option<&str>, extra_params: &[(&str, &str)]) -> Result<()> {
        let config = self.client.discover().await?;

        let Some(post_logout) = config.post_logout_redirect_uri.clone() else {
            let id_token = id_token.ok_or_else(|| {
                OAuthError::InvalidConfiguration(
                    "end session needs an id token or a post_logout_redirect_uri".to_string(),
                )
            })?;
            self.state.set(FlowState::RequestBuilt);
            self.state.set(FlowState::AwaitingExternalResult);
            let status = self.client.end_session(id_token).await?;
            if status.is_success() || status.is_redirection() {
                return Ok(());
            }
            return Err(OAuthError::AuthenticationFailure(format!(
                "End session request failed with status {}",
                status.as_u16()
            )));
        };

        let request = self
            .client
            .create_end_session_request(id_token, extra_params)
            .await?;
        self.state.set(FlowState::RequestBuilt);

        self.state.set(FlowState::AwaitingExternalResult);
        let outcome = tokio::time::timeout(
            self.timeout,
            self.user_agent.open(&request.url, &post_logout),
        )
        .await;

        match outcome {
            Ok(UserAgentOutcome::Redirect(url)) if url.as_str().starts_with(&post_logout) => {
                info!("Session ended");
                Ok(())
            }
            Ok(UserAgentOutcome::Redirect(_)) => Err(OAuthError::AuthenticationFailure(
                "Logout redirected to an unexpected URI".to_string(),
            )),
            Ok(UserAgentOutcome::Cancelled) => Err(OAuthError::AuthenticationCancelled(
                "Logout cancelled by user".to_string(),
            )),
            Ok(UserAgentOutcome::Failed(e)) => Err(e),
            Err(_) => Err(OAuthError::AuthenticationCancelled(format!(
                "No logout redirect within {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
