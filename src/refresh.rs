/// Token refresh with concurrency control
use crate::client::OidcClient;
use crate::error::{OAuthError, Result};
use crate::lock::RefreshLockManager;
use crate::store::TokenStore;
use crate::token::{AccessTokenResponse, OauthTokens};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Refreshes tokens and saves them, one refresh at a time
///
/// Callers pass the access token they found to be stale. Inside the lock the
/// stored access token is compared with it: if it already changed, another
/// caller refreshed in the meantime and the stored tokens are returned
/// without a network call. Any number of callers racing on the same stale
/// token therefore cause a single refresh.
///
/// The lock is released on every exit path, including when the refresh call
/// fails or the calling task is cancelled; the store is only written after a
/// complete token response has been received.
pub struct TokenRefreshHandler<S: TokenStore + ?Sized> {
    store: Arc<S>,
    mutex: Mutex<()>,
    process_lock: Option<(RefreshLockManager, String)>,
}

impl<S: TokenStore + ?Sized> TokenRefreshHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            mutex: Mutex::new(()),
            process_lock: None,
        }
    }

    /// Also hold a cross-process file lock for `key` while refreshing
    ///
    /// Needed when several processes share one persistent store.
    pub fn with_process_lock(mut self, manager: RefreshLockManager, key: impl Into<String>) -> Self {
        self.process_lock = Some((manager, key.into()));
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Refresh with `refresh_call` unless the stored tokens moved past `old_access_token`
    pub async fn refresh_and_save<F, Fut>(
        &self,
        refresh_call: F,
        old_access_token: &str,
    ) -> Result<OauthTokens>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<AccessTokenResponse>>,
    {
        let _guard = self.mutex.lock().await;
        let _process_guard = match &self.process_lock {
            Some((manager, key)) => Some(manager.acquire_lock_async(key).await?),
            None => None,
        };

        let current = self.store.get_access_token();
        if current.as_deref() != Some(old_access_token) {
            if let Some(tokens) = self.store.get_tokens() {
                debug!("Tokens were refreshed concurrently, skipping refresh");
                return Ok(tokens);
            }
        }

        let refresh_token = self.store.get_refresh_token().ok_or_else(|| {
            OAuthError::AuthenticationFailure("No refresh token available".to_string())
        })?;

        let response = refresh_call(refresh_token.clone()).await?;
        self.store.save_tokens(&response);
        info!("Tokens refreshed");

        let mut tokens = OauthTokens::from(&response);
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        if tokens.id_token.is_none() {
            tokens.id_token = self.store.get_id_token();
        }
        Ok(tokens)
    }

    /// Refresh through the client's token endpoint
    pub async fn refresh_with_client(
        &self,
        client: &OidcClient,
        old_access_token: &str,
    ) -> Result<OauthTokens> {
        self.refresh_and_save(
            |refresh_token| async move { client.refresh_token(&refresh_token).await },
            old_access_token,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::store::MemoryTokenStore;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn response(access: &str, refresh: Option<&str>) -> AccessTokenResponse {
        AccessTokenResponse {
            access_token: access.to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            refresh_token: refresh.map(str::to_string),
            id_token: None,
            scope: None,
            received_at: 0,
        }
    }

    fn store_with(access: &str, refresh: &str) -> Arc<MemoryTokenStore> {
        let store = Arc::new(MemoryTokenStore::new());
        store.save_tokens(&response(access, Some(refresh)));
        store
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_calls_network_once() {
        let handler = Arc::new(TokenRefreshHandler::new(store_with("AT1", "RT1")));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..16).map(|_| {
            let handler = handler.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                handler
                    .refresh_and_save(
                        |refresh_token| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(refresh_token, "RT1");
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(response("AT2", Some("RT2")))
                        },
                        "AT1",
                    )
                    .await
            })
        });

        let results: Vec<OauthTokens> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|tokens| tokens == &results[0]));
        assert_eq!(results[0].access_token, "AT2");
        assert_eq!(results[0].refresh_token.as_deref(), Some("RT2"));
    }

    #[tokio::test]
    async fn test_stale_caller_gets_stored_tokens() {
        let store = store_with("AT2", "RT2");
        let handler = TokenRefreshHandler::new(store);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let tokens = handler
            .refresh_and_save(
                |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(response("AT3", None))
                },
                "AT1",
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tokens.access_token, "AT2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("RT2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_store_and_releases_lock() {
        let store = store_with("AT1", "RT1");
        let handler = TokenRefreshHandler::new(store.clone());

        let err = handler
            .refresh_and_save(
                |_| async {
                    Err(OAuthError::UnsuccessfulTokenRequest {
                        status_code: 400,
                        body: None,
                        error_response: None,
                        cause: None,
                    })
                },
                "AT1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::UnsuccessfulTokenRequest { .. }));
        assert_eq!(store.get_access_token().as_deref(), Some("AT1"));

        // Lock was released: the next refresh goes through
        let tokens = handler
            .refresh_and_save(|_| async { Ok(response("AT2", None)) }, "AT1")
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "AT2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(store.get_refresh_token().as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn test_cancelled_refresh_releases_lock() {
        let store = store_with("AT1", "RT1");
        let handler = TokenRefreshHandler::new(store.clone());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            handler.refresh_and_save(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(response("never", None))
                },
                "AT1",
            ),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(store.get_access_token().as_deref(), Some("AT1"));

        let tokens = tokio::time::timeout(
            Duration::from_secs(5),
            handler.refresh_and_save(|_| async { Ok(response("AT2", Some("RT2"))) }, "AT1"),
        )
        .await
        .expect("lock was not released")
        .unwrap();
        assert_eq!(tokens.access_token, "AT2");
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let store = Arc::new(MemoryTokenStore::new());
        store.save_tokens(&response("AT1", None));
        let handler = TokenRefreshHandler::new(store);

        let err = handler
            .refresh_and_save(|_| async { Ok(response("AT2", None)) }, "AT1")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::AuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn test_refresh_with_client_and_process_lock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"access_token":"AT2","refresh_token":"RT2","id_token":"ID2"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new("abc")
            .with_authorization_endpoint(format!("{}/authorize", server.uri()))
            .with_token_endpoint(format!("{}/token", server.uri()));
        let client = OidcClient::new(config).unwrap();

        let lock_dir = std::env::temp_dir().join(format!("einlass_locks_{}", rand::random::<u32>()));
        let manager = RefreshLockManager::new(lock_dir.clone()).unwrap();
        let store: Arc<dyn TokenStore> = store_with("AT1", "RT1");
        let handler = TokenRefreshHandler::new(store.clone()).with_process_lock(manager.clone(), "idp");

        let tokens = handler.refresh_with_client(&client, "AT1").await.unwrap();
        assert_eq!(tokens.access_token, "AT2");
        assert_eq!(store.get_id_token().as_deref(), Some("ID2"));

        // Second stale caller is served from the store
        let again = handler.refresh_with_client(&client, "AT1").await.unwrap();
        assert_eq!(again, tokens);

        // Process lock was released after each refresh
        assert!(manager.try_acquire_lock("idp").unwrap().is_some());
        std::fs::remove_dir_all(lock_dir).ok();
    }
}
