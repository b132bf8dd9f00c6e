/// Example: Browser login against an OpenID Connect provider
///
/// Discovers the provider's endpoints, opens the system browser and receives
/// the redirect on a local loopback listener. The tokens end up in the
/// OS keychain.
///
/// Setup:
/// 1. Register a public client with redirect URI http://127.0.0.1:8080/callback
/// 2. export OIDC_ISSUER="https://idp.example.com"
/// 3. export OIDC_CLIENT_ID="your_client_id"
///
/// Run:
/// cargo run --example loopback_login
use einlass::prelude::*;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let issuer = env::var("OIDC_ISSUER").expect("OIDC_ISSUER environment variable not set");
    let client_id = env::var("OIDC_CLIENT_ID").expect("OIDC_CLIENT_ID environment variable not set");

    println!("=== Loopback Login Example ===\n");

    let agent = LoopbackUserAgent::bind(8080)
        .await
        .expect("Port 8080 is not available");
    let config = ClientConfig::new(client_id)
        .with_issuer(&issuer)
        .with_redirect_uri(agent.redirect_uri())
        .with_scope("openid profile offline_access");
    let client = Arc::new(OidcClient::new(config).expect("Invalid client configuration"));

    let flow = CodeAuthFlow::new(client.clone(), agent);
    println!("Opening the browser, finish the login there...\n");

    let response = match flow.get_access_token().await {
        Ok(response) => response,
        Err(e) if e.is_cancellation() => {
            eprintln!("Login cancelled: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Login failed: {}", e);
            std::process::exit(1);
        }
    };

    println!("Logged in");
    if let Some(expires_in) = response.expires_in {
        println!("  Access token expires in {} seconds", expires_in);
    }
    if let Some(id_token) = &response.id_token {
        match Jwt::parse(id_token) {
            Ok(jwt) => println!("  Subject: {}", jwt.payload.sub.unwrap_or_default()),
            Err(e) => eprintln!("  Could not read ID token: {}", e),
        }
    }

    let host = issuer.trim_start_matches("https://").trim_end_matches('/');
    let store = KeyringTokenStore::new("einlass-examples", host);
    store.save_tokens(&response);
    println!("\nTokens saved to the keychain under {}", host);
}
