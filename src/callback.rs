/// Loopback user agent: system browser plus a local redirect listener
use crate::error::{OAuthError, Result};
use crate::flow::{UserAgent, UserAgentOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use url::Url;

/// Default time the user gets to finish the login in the browser
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

const CALLBACK_PATH: &str = "/callback";

/// Opens a URL in a browser
pub type BrowserLauncher = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// [`UserAgent`] for CLI applications
///
/// Opens the authorization URL in the system browser and listens on
/// `127.0.0.1` for the redirect back to [`redirect_uri`](Self::redirect_uri).
/// When nothing arrives within the timeout the attempt counts as cancelled.
pub struct LoopbackUserAgent {
    listener: TcpListener,
    port: u16,
    launcher: BrowserLauncher,
    timeout: Duration,
}

impl LoopbackUserAgent {
    /// Listen on the given port, or on a random free one for `0`
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "Loopback listener bound");

        Ok(Self {
            listener,
            port,
            launcher: Arc::new(|url: &str| webbrowser::open(url)),
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        })
    }

    /// Replace the system browser, e.g. to print the URL instead
    pub fn with_launcher<F>(mut self, launcher: F) -> Self
    where
        F: Fn(&str) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Redirect URI to register with the authorization server
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, CALLBACK_PATH)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn wait_for_redirect(&self, redirect_uri: &str) -> Result<Url> {
        let base = Url::parse(redirect_uri)?;

        loop {
            let (stream, _) = self.listener.accept().await?;
            if let Some(url) = handle_connection(stream, &base, redirect_uri).await? {
                return Ok(url);
            }
        }
    }
}

#[async_trait]
impl UserAgent for LoopbackUserAgent {
    async fn open(&self, url: &Url, redirect_uri: &str) -> UserAgentOutcome {
        info!(port = self.port, "Opening browser for authorization");
        if let Err(e) = (self.launcher)(url.as_str()) {
            return UserAgentOutcome::Failed(OAuthError::technical("Failed to open browser", e));
        }

        match tokio::time::timeout(self.timeout, self.wait_for_redirect(redirect_uri)).await {
            Ok(Ok(url)) => UserAgentOutcome::Redirect(url),
            Ok(Err(e)) => UserAgentOutcome::Failed(e),
            Err(_) => {
                info!("Timed out waiting for the browser redirect");
                UserAgentOutcome::Cancelled
            }
        }
    }
}

/// Answer one HTTP request; returns the redirect URL if it was the callback
async fn handle_connection(
    mut stream: TcpStream,
    base: &Url,
    redirect_uri: &str,
) -> Result<Option<Url>> {
    let mut reader = BufReader::new(&mut stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain the headers so closing the socket does not reset the connection
    let mut header = String::new();
    while reader.read_line(&mut header).await? > 2 {
        header.clear();
    }

    // GET /callback?code=...&state=... HTTP/1.1
    let target = match request_line.split_whitespace().nth(1) {
        Some(target) => target,
        None => {
            respond(&mut stream, "400 Bad Request", "Invalid request").await?;
            return Ok(None);
        }
    };

    let url = match base.join(target) {
        Ok(url) if url.as_str().starts_with(redirect_uri) => url,
        _ => {
            debug!(path = target, "Ignoring request outside the callback path");
            respond(&mut stream, "404 Not Found", "Not found").await?;
            return Ok(None);
        }
    };

    if url.query_pairs().any(|(key, _)| key == "error") {
        respond(
            &mut stream,
            "400 Bad Request",
            "Authorization failed. You can close this window and return to your terminal.",
        )
        .await?;
    } else {
        respond(
            &mut stream,
            "200 OK",
            "Authorization successful. You can close this window and return to your terminal.",
        )
        .await?;
    }
    Ok(Some(url))
}

async fn respond(stream: &mut TcpStream, status: &str, message: &str) -> Result<()> {
    let html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{message}</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; margin-top: 20vh\">\
         <p>{message}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
