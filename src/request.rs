//! Authorization and end-session request construction
//!
//! An [`AuthCodeRequest`] carries everything needed to validate the redirect
//! and exchange the code afterwards. It is serializable so that an
//! application can persist it across a process restart between opening the
//! browser and receiving the redirect.

use crate::config::ClientConfig;
use crate::error::{OAuthError, Result};
use crate::pkce::{random_urlsafe, CodeChallengeMethod, Pkce};
use serde::{Deserialize, Serialize, Serializer};
use url::Url;

/// Pending authorization code request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCodeRequest {
    pub url: Url,
    /// Configuration the request was built with; serialized without the client secret
    #[serde(serialize_with = "without_client_secret")]
    pub config: ClientConfig,
    pub pkce: Pkce,
    pub state: String,
    pub nonce: Option<String>,
}

impl AuthCodeRequest {
    /// Exact comparison against the state returned in the redirect
    pub fn validate_state(&self, candidate: &str) -> bool {
        self.state == candidate
    }

    /// Exact comparison against the nonce claim of the ID token
    ///
    /// Always true when nonces are disabled in the configuration.
    pub fn validate_nonce(&self, candidate: &str) -> bool {
        if self.config.disable_nonce {
            return true;
        }
        self.nonce.as_deref() == Some(candidate)
    }
}

fn without_client_secret<S: Serializer>(
    config: &ClientConfig,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    ClientConfig {
        client_secret: None,
        ..config.clone()
    }
    .serialize(serializer)
}

/// Request that sends the user to the end-session endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    pub url: Url,
}

/// Fresh `state` value: 16 random bytes, base64url encoded
pub fn generate_state() -> String {
    random_urlsafe(16)
}

/// Fresh `nonce` value: 32 random bytes, base64url encoded
pub fn generate_nonce() -> String {
    random_urlsafe(32)
}

/// Build the authorization URL for the code flow
///
/// Extension parameters are applied last and replace any parameter of the
/// same name.
pub fn build_authorization_request(
    config: &ClientConfig,
    pkce: Pkce,
    state: String,
    nonce: Option<String>,
    extra_params: &[(&str, &str)],
) -> Result<AuthCodeRequest> {
    let endpoint = config
        .endpoints
        .authorization_endpoint
        .as_deref()
        .ok_or_else(|| {
            OAuthError::InvalidConfiguration("authorization_endpoint is not set".to_string())
        })?;

    let nonce = if config.disable_nonce { None } else { nonce };

    let mut params = QueryParams::default();
    params.set("client_id", &config.client_id);
    params.set("response_type", "code");
    params.set("response_mode", "query");
    if let Some(scope) = &config.scope {
        params.set("scope", scope);
    }
    if let Some(nonce) = &nonce {
        params.set("nonce", nonce);
    }
    if config.code_challenge_method != CodeChallengeMethod::Off {
        params.set("code_challenge_method", config.code_challenge_method.as_str());
        params.set("code_challenge", pkce.code_challenge());
    }
    if let Some(redirect_uri) = &config.redirect_uri {
        params.set("redirect_uri", redirect_uri);
    }
    params.set("state", &state);
    params.extend(extra_params);

    let url = params.apply_to(endpoint)?;

    Ok(AuthCodeRequest {
        url,
        config: config.clone(),
        pkce,
        state,
        nonce,
    })
}

/// Build the end-session (logout) URL
pub fn build_end_session_request(
    config: &ClientConfig,
    id_token: Option<&str>,
    extra_params: &[(&str, &str)],
) -> Result<EndSessionRequest> {
    let endpoint = config
        .endpoints
        .end_session_endpoint
        .as_deref()
        .ok_or_else(|| {
            OAuthError::InvalidConfiguration("end_session_endpoint is not set".to_string())
        })?;

    let mut params = QueryParams::default();
    if let Some(id_token) = id_token {
        params.set("id_token_hint", id_token);
    }
    if let Some(uri) = &config.post_logout_redirect_uri {
        params.set("post_logout_redirect_uri", uri);
    }
    params.extend(extra_params);

    Ok(EndSessionRequest {
        url: params.apply_to(endpoint)?,
    })
}

/// Ordered query parameters with last-write-wins on duplicate names
#[derive(Debug, Default)]
struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn set(&mut self, name: &str, value: &str) {
        self.0.retain(|(existing, _)| existing != name);
        self.0.push((name.to_string(), value.to_string()));
    }

    fn extend(&mut self, params: &[(&str, &str)]) {
        for (name, value) in params {
            self.set(name, value);
        }
    }

    fn apply_to(self, endpoint: &str) -> Result<Url> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| OAuthError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        if !self.0.is_empty() {
            url.query_pairs_mut().extend_pairs(self.0);
        }
        Ok(url)
    }
}
