use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Analysis failed: {0}")]
    Analyze(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("A critique request is already in flight")]
    Busy,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    pub fn analyze(msg: impl Into<String>) -> Self {
        Self::Analyze(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Static message sent to HTTP callers. Details stay in the server log.
    pub fn wire_message(&self) -> &'static str {
        match self {
            RelayError::Upload(_) => "Failed to upload image",
            RelayError::BadRequest(_) => "Invalid request body",
            RelayError::Analyze(_) | RelayError::Http(_) => "Failed to analyze image",
            RelayError::Busy | RelayError::Config(_) | RelayError::Io(_) => "Internal server error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::BadRequest(_) => 400,
            RelayError::Busy => 429,
            _ => 500,
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for RelayError {
    fn from(err: validator::ValidationErrors) -> Self {
        RelayError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_hide_details() {
        let err = RelayError::upload("bucket refused write: AccessDenied");
        assert_eq!(err.wire_message(), "Failed to upload image");
        assert_eq!(err.status_code(), 500);

        let err = RelayError::analyze("HTTP 429: rate limited");
        assert_eq!(err.wire_message(), "Failed to analyze image");

        let err = RelayError::bad_request("missing field `image`");
        assert_eq!(err.status_code(), 400);
    }
}
