/// Token persistence with pluggable storage
use crate::token::{AccessTokenResponse, OauthTokens};
use keyring::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// The token slots a store keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
    IdToken,
}

impl TokenKind {
    pub const ALL: [TokenKind; 3] = [Self::AccessToken, Self::RefreshToken, Self::IdToken];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::IdToken => "id_token",
        }
    }
}

/// Storage interface for tokens
///
/// Implementations never fail towards the caller: a slot that cannot be read
/// is reported as absent and a failed write is dropped, because a missing
/// token means the same as "not authenticated". Failures should be logged.
pub trait TokenStore: Send + Sync {
    /// Read a token slot
    fn get(&self, kind: TokenKind) -> Option<String>;

    /// Write a token slot
    fn put(&self, kind: TokenKind, value: &str);

    /// Clear a token slot
    fn remove(&self, kind: TokenKind);

    /// Clear every slot
    fn clear(&self) {
        for kind in TokenKind::ALL {
            self.remove(kind);
        }
    }

    fn get_access_token(&self) -> Option<String> {
        self.get(TokenKind::AccessToken)
    }

    fn get_refresh_token(&self) -> Option<String> {
        self.get(TokenKind::RefreshToken)
    }

    fn get_id_token(&self) -> Option<String> {
        self.get(TokenKind::IdToken)
    }

    /// All stored tokens; `None` without an access token
    fn get_tokens(&self) -> Option<OauthTokens> {
        collect_tokens(|kind| self.get(kind))
    }

    /// Persist a token response
    ///
    /// The access token is always replaced. Refresh and ID tokens are only
    /// replaced when the response carries them, so a refresh response without
    /// a new refresh token keeps the current one (RFC 6749 section 6).
    ///
    /// Backends that can should override this to write all slots at once.
    fn save_tokens(&self, response: &AccessTokenResponse) {
        for (kind, value) in response_slots(response) {
            self.put(kind, value);
        }
    }

    fn remove_tokens(&self) {
        self.clear();
    }
}

fn collect_tokens(mut lookup: impl FnMut(TokenKind) -> Option<String>) -> Option<OauthTokens> {
    Some(OauthTokens {
        access_token: lookup(TokenKind::AccessToken)?,
        refresh_token: lookup(TokenKind::RefreshToken),
        id_token: lookup(TokenKind::IdToken),
    })
}

/// The slots a token response replaces
fn response_slots(response: &AccessTokenResponse) -> impl Iterator<Item = (TokenKind, &str)> {
    [
        Some((TokenKind::AccessToken, response.access_token.as_str())),
        response
            .refresh_token
            .as_deref()
            .map(|token| (TokenKind::RefreshToken, token)),
        response.id_token.as_deref().map(|token| (TokenKind::IdToken, token)),
    ]
    .into_iter()
    .flatten()
}

/// In-memory token store
///
/// Thread-safe and process-local. Suitable for testing and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<TokenKind, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        self.tokens.read().get(&kind).cloned()
    }

    fn put(&self, kind: TokenKind, value: &str) {
        self.tokens.write().insert(kind, value.to_string());
    }

    fn remove(&self, kind: TokenKind) {
        self.tokens.write().remove(&kind);
    }

    fn clear(&self) {
        self.tokens.write().clear();
    }

    fn get_tokens(&self) -> Option<OauthTokens> {
        let tokens = self.tokens.read();
        collect_tokens(|kind| tokens.get(&kind).cloned())
    }

    fn save_tokens(&self, response: &AccessTokenResponse) {
        let mut tokens = self.tokens.write();
        for (kind, value) in response_slots(response) {
            tokens.insert(kind, value.to_string());
        }
    }
}

/// File-based token store following XDG conventions
///
/// Each namespace (usually the identity provider's host) has its own
/// `tokens_<namespace>.json` file under the storage directory.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    io: Mutex<()>,
}

impl FileTokenStore {
    /// Store tokens under the user data directory for `app_name`
    ///
    /// Respects `$XDG_DATA_HOME`, falling back to the platform data directory
    /// (`~/.local/share` on Linux, `AppData` on Windows).
    ///
    /// # Example
    ///
    /// ```
    /// use einlass::store::FileTokenStore;
    ///
    /// let store = FileTokenStore::new("my-app", "idp.example.com").unwrap();
    /// ```
    pub fn new(app_name: &str, namespace: &str) -> std::io::Result<Self> {
        let base_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(xdg_data) => PathBuf::from(xdg_data),
            Err(_) => dirs::data_dir().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine data directory",
                )
            })?,
        };

        Self::with_dir(base_dir.join(app_name), namespace)
    }

    /// Store tokens in a custom directory
    pub fn with_dir(dir: PathBuf, namespace: &str) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let safe_namespace = namespace.replace(['/', '\\', ':'], "_");

        Ok(Self {
            path: dir.join(format!("tokens_{}.json", safe_namespace)),
            io: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(&self) -> HashMap<String, String> {
        if !self.path.exists() {
            return HashMap::new();
        }

        let parsed = fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()));

        match parsed {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                HashMap::new()
            }
        }
    }

    fn update(&self, change: impl FnOnce(&mut HashMap<String, String>)) {
        let _guard = self.io.lock();
        let mut tokens = self.load();
        change(&mut tokens);

        // Write a sibling file and rename it so readers never see a partial file
        let staging = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        let written = serde_json::to_string_pretty(&tokens)
            .map_err(|e| e.to_string())
            .and_then(|content| fs::write(&staging, content).map_err(|e| e.to_string()))
            .and_then(|()| fs::rename(&staging, &self.path).map_err(|e| e.to_string()));

        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "Failed to write token file");
        }
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        let _guard = self.io.lock();
        self.load().remove(kind.as_str())
    }

    fn put(&self, kind: TokenKind, value: &str) {
        self.update(|tokens| {
            tokens.insert(kind.as_str().to_string(), value.to_string());
        });
    }

    fn remove(&self, kind: TokenKind) {
        self.update(|tokens| {
            tokens.remove(kind.as_str());
        });
    }

    fn get_tokens(&self) -> Option<OauthTokens> {
        let mut tokens = {
            let _guard = self.io.lock();
            self.load()
        };
        collect_tokens(|kind| tokens.remove(kind.as_str()))
    }

    fn save_tokens(&self, response: &AccessTokenResponse) {
        self.update(|tokens| {
            for (kind, value) in response_slots(response) {
                tokens.insert(kind.as_str().to_string(), value.to_string());
            }
        });
    }

    fn clear(&self) {
        let _guard = self.io.lock();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove token file");
            }
        }
    }
}

/// Secure token store using the OS credential manager
///
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service API (libsecret)
///
/// Each slot is a separate credential of service `einlass-<app_name>` and
/// account `<namespace>:<slot>`.
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service: String,
    namespace: String,
}

impl KeyringTokenStore {
    pub fn new(app_name: &str, namespace: &str) -> Self {
        Self {
            service: format!("einlass-{}", app_name),
            namespace: namespace.to_string(),
        }
    }

    fn entry(&self, kind: TokenKind) -> Option<Entry> {
        let account = format!("{}:{}", self.namespace, kind.as_str());
        match Entry::new(&self.service, &account) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(service = %self.service, error = %e, "Failed to create keyring entry");
                None
            }
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        match self.entry(kind)?.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(slot = kind.as_str(), error = %e, "Failed to read token from keyring");
                None
            }
        }
    }

    fn put(&self, kind: TokenKind, value: &str) {
        if let Some(entry) = self.entry(kind) {
            if let Err(e) = entry.set_password(value) {
                warn!(slot = kind.as_str(), error = %e, "Failed to save token to keyring");
            }
        }
    }

    fn remove(&self, kind: TokenKind) {
        if let Some(entry) = self.entry(kind) {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    warn!(slot = kind.as_str(), error = %e, "Failed to delete token from keyring")
                }
            }
        }
    }
}
