/// Example: Token refresh shared by several processes
///
/// Every process holds the same stale access token. The file lock and the
/// check against the stored token make exactly one of them refresh; the
/// others pick up its result from the shared token file.
///
/// Run several instances at once:
/// ```bash
/// cargo run --example cross_process_refresh &
/// cargo run --example cross_process_refresh &
/// cargo run --example cross_process_refresh &
/// wait
/// ```
use einlass::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const STALE_TOKEN: &str = "stale-access-token";

#[tokio::main]
async fn main() {
    let pid = std::process::id();
    println!("=== Cross-Process Refresh Example (pid {}) ===\n", pid);

    let store = Arc::new(
        FileTokenStore::new("einlass-examples", "refresh-demo")
            .expect("Failed to create file storage"),
    );
    if store.get_access_token().is_none() {
        store.save_tokens(&AccessTokenResponse {
            access_token: STALE_TOKEN.to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(0),
            refresh_token: Some("refresh-token".to_string()),
            id_token: None,
            scope: None,
            received_at: 0,
        });
    }

    let locks = RefreshLockManager::for_app("einlass-examples").expect("Failed to create lock dir");
    let handler = TokenRefreshHandler::new(store.clone()).with_process_lock(locks, "refresh-demo");

    // Stands in for OidcClient::refresh_token so the example runs offline
    let result = handler
        .refresh_and_save(
            |refresh_token| async move {
                println!("[{}] Refreshing with {}", pid, refresh_token);
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(AccessTokenResponse {
                    access_token: format!("access-token-from-{}", pid),
                    token_type: Some("Bearer".to_string()),
                    expires_in: Some(3600),
                    refresh_token: None,
                    id_token: None,
                    scope: None,
                    received_at: 0,
                })
            },
            STALE_TOKEN,
        )
        .await;

    match result {
        Ok(tokens) => println!("[{}] Access token: {}", pid, tokens.access_token),
        Err(e) => {
            eprintln!("[{}] Refresh failed: {}", pid, e);
            std::process::exit(1);
        }
    }
}
