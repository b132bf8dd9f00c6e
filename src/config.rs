/// Client configuration and OpenID Connect discovery
use crate::error::{OAuthError, Result};
use crate::pkce::CodeChallengeMethod;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Well-known path of the OpenID Connect discovery document
pub const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Identity provider endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
}

/// OAuth 2.0 / OpenID Connect client configuration
///
/// Either `discovery_uri` or both the authorization and token endpoints must
/// be set. Endpoints set explicitly always take precedence over discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub discovery_uri: Option<String>,
    pub endpoints: Endpoints,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub code_challenge_method: CodeChallengeMethod,
    pub redirect_uri: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    pub disable_nonce: bool,
}

impl ClientConfig {
    /// Create a configuration for a client id; everything else is unset
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Use an OpenID Connect discovery document to fill unset endpoints
    pub fn with_discovery_uri(mut self, uri: impl Into<String>) -> Self {
        self.discovery_uri = Some(uri.into());
        self
    }

    /// Derive the discovery URI from an issuer base URL
    pub fn with_issuer(self, issuer: &str) -> Self {
        let uri = format!("{}/{}", issuer.trim_end_matches('/'), DISCOVERY_PATH);
        self.with_discovery_uri(uri)
    }

    pub fn with_authorization_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.authorization_endpoint = Some(url.into());
        self
    }

    pub fn with_token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.token_endpoint = Some(url.into());
        self
    }

    pub fn with_end_session_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.end_session_endpoint = Some(url.into());
        self
    }

    pub fn with_revocation_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.revocation_endpoint = Some(url.into());
        self
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    pub fn with_post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_logout_redirect_uri = Some(uri.into());
        self
    }

    pub fn with_code_challenge_method(mut self, method: CodeChallengeMethod) -> Self {
        self.code_challenge_method = method;
        self
    }

    pub fn with_nonce_disabled(mut self) -> Self {
        self.disable_nonce = true;
        self
    }

    /// Check the static configuration
    ///
    /// Fails with `InvalidConfiguration` when the client id is missing and with
    /// `InvalidUrl` when there is no discovery URI and the authorization or
    /// token endpoint is missing, or when any configured URL does not parse.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(OAuthError::InvalidConfiguration(
                "client_id must be set".to_string(),
            ));
        }

        let has_discovery = self
            .discovery_uri
            .as_deref()
            .is_some_and(|uri| !uri.trim().is_empty());

        if !has_discovery {
            if self.endpoints.token_endpoint.is_none() {
                return Err(OAuthError::InvalidUrl(
                    "token_endpoint must be set when no discovery_uri is configured".to_string(),
                ));
            }
            if self.endpoints.authorization_endpoint.is_none() {
                return Err(OAuthError::InvalidUrl(
                    "authorization_endpoint must be set when no discovery_uri is configured"
                        .to_string(),
                ));
            }
        }

        for (name, value) in self.urls() {
            if let Some(value) = value {
                Url::parse(value)
                    .map_err(|e| OAuthError::InvalidUrl(format!("{}: {} ({})", name, value, e)))?;
            }
        }

        Ok(())
    }

    /// True when some endpoint discovery could provide is still unset
    pub fn needs_discovery(&self) -> bool {
        self.discovery_uri.is_some()
            && (self.endpoints.authorization_endpoint.is_none()
                || self.endpoints.token_endpoint.is_none()
                || self.endpoints.end_session_endpoint.is_none()
                || self.endpoints.userinfo_endpoint.is_none()
                || self.endpoints.revocation_endpoint.is_none())
    }

    /// Merge a discovery document into this configuration
    ///
    /// Only fields that are currently unset are filled in. A value the caller
    /// configured explicitly is never replaced.
    pub fn update_with_discovery(&mut self, document: &DiscoveryDocument) {
        let endpoints = &mut self.endpoints;
        fill(
            &mut endpoints.authorization_endpoint,
            &document.authorization_endpoint,
        );
        fill(&mut endpoints.token_endpoint, &document.token_endpoint);
        fill(
            &mut endpoints.end_session_endpoint,
            &document.end_session_endpoint,
        );
        fill(&mut endpoints.userinfo_endpoint, &document.userinfo_endpoint);
        fill(
            &mut endpoints.revocation_endpoint,
            &document.revocation_endpoint,
        );

        if self.scope.is_none() {
            if let Some(scopes) = document.scopes_supported.as_ref().filter(|s| !s.is_empty()) {
                self.scope = Some(scopes.join(" "));
            }
        }

        debug!(
            issuer = document.issuer.as_deref().unwrap_or("<unknown>"),
            "Merged discovery document into client configuration"
        );
    }

    fn urls(&self) -> [(&'static str, Option<&String>); 8] {
        [
            ("discovery_uri", self.discovery_uri.as_ref()),
            (
                "authorization_endpoint",
                self.endpoints.authorization_endpoint.as_ref(),
            ),
            ("token_endpoint", self.endpoints.token_endpoint.as_ref()),
            (
                "end_session_endpoint",
                self.endpoints.end_session_endpoint.as_ref(),
            ),
            ("userinfo_endpoint", self.endpoints.userinfo_endpoint.as_ref()),
            (
                "revocation_endpoint",
                self.endpoints.revocation_endpoint.as_ref(),
            ),
            ("redirect_uri", self.redirect_uri.as_ref()),
            (
                "post_logout_redirect_uri",
                self.post_logout_redirect_uri.as_ref(),
            ),
        ]
    }
}

fn fill(target: &mut Option<String>, value: &Option<String>) {
    if target.is_none() {
        target.clone_from(value);
    }
}

/// The subset of the OpenID Connect discovery document this crate consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryDocument {
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub scopes_supported: Option<Vec<String>>,
}
