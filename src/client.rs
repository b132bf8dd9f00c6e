/// OpenID Connect client: endpoint resolution and token endpoint exchanges
use crate::config::{ClientConfig, DiscoveryDocument};
use crate::error::{OAuthError, Result};
use crate::pkce::{CodeChallengeMethod, Pkce};
use crate::request::{self, AuthCodeRequest, EndSessionRequest};
use crate::token::{AccessTokenResponse, ErrorResponse};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A form-encoded POST to the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub url: Url,
    pub params: Vec<(String, String)>,
}

impl TokenRequest {
    fn new(url: Url) -> Self {
        Self {
            url,
            params: Vec::new(),
        }
    }

    fn param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    fn optional_param(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// Value of a form parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn grant_type(&self) -> &str {
        self.get("grant_type").unwrap_or("unknown")
    }
}

/// OpenID Connect client
///
/// Builds authorization requests and performs the authorization code,
/// refresh token and revocation exchanges. When a discovery URI is configured
/// the discovery document is fetched on first use and merged into the
/// configuration once; explicitly configured endpoints are never replaced.
#[derive(Debug)]
pub struct OidcClient {
    config: ClientConfig,
    http: reqwest::Client,
    resolved: OnceCell<ClientConfig>,
}

impl OidcClient {
    /// Create a client with a default HTTP client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Self::with_http_client(config, http)
    }

    /// Create a client that shares an existing HTTP client
    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            http,
            resolved: OnceCell::new(),
        })
    }

    /// The configuration as supplied, before discovery
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve the configuration, fetching discovery if endpoints are missing
    ///
    /// The merge happens at most once per client. A failed fetch is not
    /// cached, so a later call retries.
    pub async fn discover(&self) -> Result<&ClientConfig> {
        self.resolved
            .get_or_try_init(|| async {
                let mut config = self.config.clone();
                if let Some(uri) = config.discovery_uri.clone().filter(|_| config.needs_discovery()) {
                    let document = self.fetch_discovery_document(&uri).await?;
                    config.update_with_discovery(&document);
                }
                Ok::<_, OAuthError>(config)
            })
            .await
    }

    /// GET and parse a discovery document
    pub async fn fetch_discovery_document(&self, uri: &str) -> Result<DiscoveryDocument> {
        debug!(uri, "Fetching discovery document");
        let response = self
            .http
            .get(uri)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Build a fresh authorization code request (new PKCE pair, state and nonce)
    pub async fn create_auth_code_request(
        &self,
        extra_params: &[(&str, &str)],
    ) -> Result<AuthCodeRequest> {
        let config = self.discover().await?;
        request::build_authorization_request(
            config,
            Pkce::generate(config.code_challenge_method),
            request::generate_state(),
            Some(request::generate_nonce()),
            extra_params,
        )
    }

    /// Build an end-session request
    pub async fn create_end_session_request(
        &self,
        id_token: Option<&str>,
        extra_params: &[(&str, &str)],
    ) -> Result<EndSessionRequest> {
        let config = self.discover().await?;
        request::build_end_session_request(config, id_token, extra_params)
    }

    /// Form parameters for the `authorization_code` grant
    pub async fn create_access_token_request(
        &self,
        auth_request: &AuthCodeRequest,
        code: &str,
    ) -> Result<TokenRequest> {
        let snapshot = &auth_request.config;
        let url = match snapshot.endpoints.token_endpoint.as_deref() {
            Some(endpoint) => parse_endpoint("token_endpoint", endpoint)?,
            None => self.token_endpoint().await?,
        };

        let verifier = (snapshot.code_challenge_method != CodeChallengeMethod::Off)
            .then(|| auth_request.pkce.code_verifier());

        Ok(TokenRequest::new(url)
            .param("grant_type", "authorization_code")
            .param("code", code)
            .optional_param("redirect_uri", snapshot.redirect_uri.as_deref())
            .param("client_id", &snapshot.client_id)
            .optional_param(
                "client_secret",
                snapshot
                    .client_secret
                    .as_deref()
                    .or(self.config.client_secret.as_deref()),
            )
            .optional_param("code_verifier", verifier))
    }

    /// Form parameters for the `refresh_token` grant
    pub async fn create_refresh_token_request(&self, refresh_token: &str) -> Result<TokenRequest> {
        let config = self.token_config().await?;
        let url = token_endpoint_of(config)?;

        Ok(TokenRequest::new(url)
            .param("grant_type", "refresh_token")
            .param("client_id", &config.client_id)
            .optional_param("client_secret", config.client_secret.as_deref())
            .param("refresh_token", refresh_token)
            .optional_param("scope", config.scope.as_deref()))
    }

    /// POST a token request and map the outcome
    ///
    /// A 2xx body must parse as an access token response; anything else
    /// becomes `UnsuccessfulTokenRequest` carrying the status, the raw body
    /// and the parsed error response when the body has one.
    pub async fn execute(&self, request: TokenRequest) -> Result<AccessTokenResponse> {
        debug!(
            endpoint = %request.url,
            grant_type = request.grant_type(),
            "Executing token request"
        );

        let response = self
            .http
            .post(request.url)
            .header(ACCEPT, "application/json")
            .form(&request.params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Token endpoint rejected the request");
            return Err(unsuccessful(status, body, None));
        }

        if body.trim().is_empty() {
            return Err(unsuccessful(
                status,
                body,
                Some("token endpoint returned an empty body".into()),
            ));
        }

        match AccessTokenResponse::from_body(&body) {
            Ok(response) => Ok(response),
            Err(e) => Err(unsuccessful(status, body, Some(Box::new(e)))),
        }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_token(
        &self,
        auth_request: &AuthCodeRequest,
        code: &str,
    ) -> Result<AccessTokenResponse> {
        let request = self.create_access_token_request(auth_request, code).await?;
        self.execute(request).await
    }

    /// Obtain new tokens with a refresh token
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AccessTokenResponse> {
        let request = self.create_refresh_token_request(refresh_token).await?;
        self.execute(request).await
    }

    /// Revoke an access or refresh token (RFC 7009)
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        let config = self.discover().await?;
        let endpoint = config.endpoints.revocation_endpoint.as_deref().ok_or_else(|| {
            OAuthError::InvalidConfiguration("revocation_endpoint is not set".to_string())
        })?;

        let request = TokenRequest::new(parse_endpoint("revocation_endpoint", endpoint)?)
            .param("token", token)
            .param("client_id", &config.client_id)
            .optional_param("client_secret", config.client_secret.as_deref());

        let response = self
            .http
            .post(request.url)
            .form(&request.params)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            info!("Token revoked");
            return Ok(());
        }

        let body = response.text().await?;
        warn!(status = status.as_u16(), "Revocation endpoint rejected the request");
        Err(unsuccessful(status, body, None))
    }

    /// Call the end-session endpoint directly with an `id_token_hint`
    ///
    /// Used when there is no post-logout redirect for a browser to follow.
    pub async fn end_session(&self, id_token: &str) -> Result<StatusCode> {
        let request = self.create_end_session_request(Some(id_token), &[]).await?;
        let status = self.http.get(request.url).send().await?.status();
        debug!(status = status.as_u16(), "End-session request completed");
        Ok(status)
    }

    async fn token_endpoint(&self) -> Result<Url> {
        token_endpoint_of(self.token_config().await?)
    }

    /// Configuration for token endpoint calls
    ///
    /// Discovery is only consulted when no token endpoint is configured and
    /// it has not been resolved yet.
    async fn token_config(&self) -> Result<&ClientConfig> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(resolved);
        }
        if self.config.endpoints.token_endpoint.is_some() {
            return Ok(&self.config);
        }
        self.discover().await
    }
}

fn token_endpoint_of(config: &ClientConfig) -> Result<Url> {
    let endpoint = config.endpoints.token_endpoint.as_deref().ok_or_else(|| {
        OAuthError::InvalidUrl("token_endpoint is not set and discovery did not provide one".to_string())
    })?;
    parse_endpoint("token_endpoint", endpoint)
}

fn parse_endpoint(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| OAuthError::InvalidUrl(format!("{}: {} ({})", name, value, e)))
}

fn unsuccessful(
    status: StatusCode,
    body: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
) -> OAuthError {
    OAuthError::UnsuccessfulTokenRequest {
        status_code: status.as_u16(),
        error_response: ErrorResponse::parse(&body),
        body: (!body.is_empty()).then_some(body),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ErrorCode;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ClientConfig {
        ClientConfig::new("abc")
            .with_authorization_endpoint(format!("{}/authorize", server.uri()))
            .with_token_endpoint(format!("{}/token", server.uri()))
            .with_redirect_uri("https://app/cb")
            .with_scope("openid profile")
    }

    fn discovery_body(server: &MockServer) -> serde_json::Value {
        serde_json::json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "end_session_endpoint": format!("{}/logout", server.uri()),
            "revocation_endpoint": format!("{}/revoke", server.uri()),
            "scopes_supported": ["openid", "email"]
        })
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=XYZ"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"access_token":"AT1","token_type":"Bearer","expires_in":3600}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = OidcClient::new(config(&server)).unwrap();
        let request = client.create_auth_code_request(&[]).await.unwrap();
        let response = client.exchange_token(&request, "XYZ").await.unwrap();

        assert_eq!(response.access_token, "AT1");
        assert_eq!(response.expires_in, Some(3600));
        assert!(response.received_at > 0);
    }

    #[tokio::test]
    async fn test_exchange_code_error_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":"invalid_grant","error_description":"Code expired"}"#,
            ))
            .mount(&server)
            .await;

        let client = OidcClient::new(config(&server)).unwrap();
        let request = client.create_auth_code_request(&[]).await.unwrap();
        let err = client.exchange_token(&request, "XYZ").await.unwrap_err();

        match err {
            OAuthError::UnsuccessfulTokenRequest {
                status_code,
                error_response,
                body,
                ..
            } => {
                assert_eq!(status_code, 400);
                let error_response = error_response.unwrap();
                assert_eq!(error_response.error.as_str(), "invalid_grant");
                assert_eq!(error_response.error_description.as_deref(), Some("Code expired"));
                assert!(body.unwrap().contains("invalid_grant"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_without_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let client = OidcClient::new(config(&server)).unwrap();
        let err = client.refresh_token("RT").await.unwrap_err();

        assert!(matches!(
            err,
            OAuthError::UnsuccessfulTokenRequest {
                status_code: 502,
                error_response: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_success_with_undecodable_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"token_type\":\"Bearer\"}"))
            .mount(&server)
            .await;

        let client = OidcClient::new(config(&server)).unwrap();
        let err = client.refresh_token("RT").await.unwrap_err();

        match err {
            OAuthError::UnsuccessfulTokenRequest {
                status_code, cause, ..
            } => {
                assert_eq!(status_code, 200);
                assert!(cause.is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_with_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = OidcClient::new(config(&server)).unwrap();
        let err = client.refresh_token("RT").await.unwrap_err();

        assert!(matches!(
            err,
            OAuthError::UnsuccessfulTokenRequest {
                body: None,
                cause: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_access_token_request_parameters() {
        let server = MockServer::start().await;
        let client = OidcClient::new(config(&server).with_client_secret("s3cret")).unwrap();
        let request = client.create_auth_code_request(&[]).await.unwrap();

        let token_request = client.create_access_token_request(&request, "XYZ").await.unwrap();
        assert_eq!(token_request.url.as_str(), format!("{}/token", server.uri()));
        assert_eq!(token_request.get("grant_type"), Some("authorization_code"));
        assert_eq!(token_request.get("code"), Some("XYZ"));
        assert_eq!(token_request.get("redirect_uri"), Some("https://app/cb"));
        assert_eq!(token_request.get("client_id"), Some("abc"));
        assert_eq!(token_request.get("client_secret"), Some("s3cret"));
        assert_eq!(
            token_request.get("code_verifier"),
            Some(request.pkce.code_verifier())
        );
    }

    #[tokio::test]
    async fn test_restored_request_uses_client_secret() {
        let server = MockServer::start().await;
        let client = OidcClient::new(config(&server).with_client_secret("s3cret")).unwrap();
        let request = client.create_auth_code_request(&[]).await.unwrap();

        let persisted = serde_json::to_string(&request).unwrap();
        let restored: AuthCodeRequest = serde_json::from_str(&persisted).unwrap();

        let token_request = client.create_access_token_request(&restored, "XYZ").await.unwrap();
        assert_eq!(token_request.get("client_secret"), Some("s3cret"));
        assert_eq!(
            token_request.get("code_verifier"),
            Some(request.pkce.code_verifier())
        );
    }

    #[tokio::test]
    async fn test_pkce_off_omits_verifier() {
        let server = MockServer::start().await;
        let config = config(&server).with_code_challenge_method(CodeChallengeMethod::Off);
        let client = OidcClient::new(config).unwrap();
        let request = client.create_auth_code_request(&[]).await.unwrap();

        let token_request = client.create_access_token_request(&request, "XYZ").await.unwrap();
        assert!(token_request.get("code_verifier").is_none());
    }

    #[tokio::test]
    async fn test_refresh_token_request_parameters() {
        let server = MockServer::start().await;
        let client = OidcClient::new(config(&server)).unwrap();

        let request = client.create_refresh_token_request("RT").await.unwrap();
        assert_eq!(request.get("grant_type"), Some("refresh_token"));
        assert_eq!(request.get("client_id"), Some("abc"));
        assert_eq!(request.get("refresh_token"), Some("RT"));
        assert_eq!(request.get("scope"), Some("openid profile"));
        assert!(request.get("client_secret").is_none());
    }

    #[tokio::test]
    async fn test_discovery_on_demand_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server)))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("abc")
            .with_issuer(&server.uri())
            .with_end_session_endpoint("https://custom/logout");
        let client = OidcClient::new(config).unwrap();

        let resolved = client.discover().await.unwrap();
        assert_eq!(
            resolved.endpoints.token_endpoint,
            Some(format!("{}/token", server.uri()))
        );
        assert_eq!(
            resolved.endpoints.end_session_endpoint.as_deref(),
            Some("https://custom/logout")
        );
        assert_eq!(resolved.scope.as_deref(), Some("openid email"));

        // Resolution is cached: no second GET
        let request = client.create_refresh_token_request("RT").await.unwrap();
        assert_eq!(request.url.as_str(), format!("{}/token", server.uri()));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_technical() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = OidcClient::new(ClientConfig::new("abc").with_issuer(&server.uri())).unwrap();
        let err = client.create_auth_code_request(&[]).await.unwrap_err();

        assert!(matches!(err, OAuthError::TechnicalFailure { .. }));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server)))
            .expect(1)
            .mount(&server)
            .await;

        let client = OidcClient::new(ClientConfig::new("abc").with_issuer(&server.uri())).unwrap();
        assert!(matches!(
            client.create_auth_code_request(&[]).await,
            Err(OAuthError::TechnicalFailure { .. })
        ));

        let request = client.create_auth_code_request(&[]).await.unwrap();
        assert!(request
            .url
            .as_str()
            .starts_with(&format!("{}/authorize", server.uri())));
        // Resolved now, no third fetch
        client.create_auth_code_request(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_token_endpoint_skips_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(503))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"AT2"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("abc")
            .with_issuer(&server.uri())
            .with_authorization_endpoint(format!("{}/authorize", server.uri()))
            .with_token_endpoint(format!("{}/token", server.uri()));
        let client = OidcClient::new(config).unwrap();

        let response = client.refresh_token("RT").await.unwrap();
        assert_eq!(response.access_token, "AT2");
    }

    #[tokio::test]
    async fn test_revoke_token_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"unsupported_token_type"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server).with_revocation_endpoint(format!("{}/revoke", server.uri()));
        let client = OidcClient::new(config).unwrap();

        match client.revoke_token("RT").await {
            Err(OAuthError::UnsuccessfulTokenRequest {
                status_code,
                error_response,
                ..
            }) => {
                assert_eq!(status_code, 400);
                assert_eq!(
                    error_response.map(|e| e.error),
                    Some(ErrorCode::Other("unsupported_token_type".to_string()))
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revoke_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .and(body_string_contains("token=RT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server).with_revocation_endpoint(format!("{}/revoke", server.uri()));
        let client = OidcClient::new(config).unwrap();
        client.revoke_token("RT").await.unwrap();

        let without = OidcClient::new(self::config(&server)).unwrap();
        assert!(matches!(
            without.revoke_token("RT").await,
            Err(OAuthError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_end_session_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logout"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server).with_end_session_endpoint(format!("{}/logout", server.uri()));
        let client = OidcClient::new(config).unwrap();

        assert_eq!(client.end_session("ID").await.unwrap(), StatusCode::OK);
    }

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            OidcClient::new(ClientConfig::new("abc")),
            Err(OAuthError::InvalidUrl(_))
        ));
    }
}
