//! Error types for pushgate.

use thiserror::Error;

/// Main error type for pushgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading or parsing error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pushkin could not be constructed from its configuration.
    #[error("Pushkin setup error: {0}")]
    PushkinSetup(String),

    /// The inbound notification failed validation.
    #[error("Invalid notification: {0}")]
    InvalidNotification(String),

    /// APNs dispatch error.
    #[error("APNs error: {0}")]
    Apns(String),

    /// FCM dispatch error.
    #[error("FCM error: {0}")]
    Fcm(String),

    /// WebPush dispatch error.
    #[error("WebPush error: {0}")]
    WebPush(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JWT signing error.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Base64 decoding error.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing apps section".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing apps section");
    }

    #[test]
    fn test_error_display_pushkin_setup() {
        let err = Error::PushkinSetup("no API key set".to_string());
        assert_eq!(err.to_string(), "Pushkin setup error: no API key set");
    }

    #[test]
    fn test_error_display_invalid_notification() {
        let err = Error::InvalidNotification("no devices".to_string());
        assert_eq!(err.to_string(), "Invalid notification: no devices");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("IO error"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_error_from_hex() {
        let hex_err = hex::decode("not hex!").unwrap_err();
        let err: Error = hex_err.into();
        assert!(err.to_string().contains("Hex decode error"));
    }

    #[test]
    fn test_error_from_base64() {
        use base64::prelude::*;
        let b64_err = BASE64_STANDARD.decode("not valid base64!!!").unwrap_err();
        let err: Error = b64_err.into();
        assert!(err.to_string().contains("Base64 decode error"));
    }
}
