use std::time::Duration;
use thiserror::Error;

/// Failures of the push or poll channel. The coordinator absorbs these and
/// switches producers; they never reach the observer as hard errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no traffic for {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("command transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("no command sink configured")]
    Unconfigured,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Unavailable(err.to_string())
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}
