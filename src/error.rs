/// Error types for Einlass OAuth/OpenID Connect operations
use crate::token::ErrorResponse;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Authentication cancelled: {0}")]
    AuthenticationCancelled(String),

    #[error("Token request failed with status {status_code}{}", describe_error_response(.error_response))]
    UnsuccessfulTokenRequest {
        status_code: u16,
        body: Option<String>,
        error_response: Option<ErrorResponse>,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("{message}")]
    TechnicalFailure {
        message: String,
        #[source]
        source: BoxError,
    },
}

impl OAuthError {
    /// Wrap an unexpected underlying failure, keeping it as the error source
    pub fn technical(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::TechnicalFailure {
            message: message.into(),
            source: source.into(),
        }
    }

    /// True when the user aborted the flow, as opposed to a protocol or network fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::AuthenticationCancelled(_))
    }

    /// The parsed token endpoint error, if this is an unsuccessful token request
    pub fn error_response(&self) -> Option<&ErrorResponse> {
        match self {
            Self::UnsuccessfulTokenRequest { error_response, .. } => error_response.as_ref(),
            _ => None,
        }
    }
}

fn describe_error_response(response: &Option<ErrorResponse>) -> String {
    match response {
        Some(ErrorResponse {
            error,
            error_description: Some(description),
            ..
        }) => format!(": {} ({})", error, description),
        Some(response) => format!(": {}", response.error),
        None => String::new(),
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(err: reqwest::Error) -> Self {
        Self::technical(format!("HTTP request failed: {}", err), err)
    }
}

impl From<serde_json::Error> for OAuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::technical(format!("JSON parsing failed: {}", err), err)
    }
}

impl From<std::io::Error> for OAuthError {
    fn from(err: std::io::Error) -> Self {
        Self::technical(format!("I/O error: {}", err), err)
    }
}

impl From<url::ParseError> for OAuthError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OAuthError>;
