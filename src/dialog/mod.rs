//! Dialog/NLU augmentation
//!
//! The relay only depends on the [`Augmentor`] trait: hand it an utterance,
//! get back augmented text or nothing. [`DialogAugmentor`] is the production
//! implementation, running the login/talk/fetch/logout round trip against a
//! [`DialogBackend`].

mod augmentor;
mod client;
pub mod types;

pub use augmentor::{DialogAugmentor, RetryPolicy};
pub use client::{DialogBackend, HttpDialogBackend};

use futures_util::future::BoxFuture;

/// Errors from the dialog backend. Never leave the augmentor.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogError {
    /// Transport failure or per-request timeout
    Network(String),
    /// Backend answered with a non-success status
    Api { status: u16, message: String },
    /// Body did not parse
    Parse(String),
    /// Login succeeded but carried no access token
    MissingToken,
    /// Fetched result has no `domain`
    EmptyClassification,
}

impl std::fmt::Display for DialogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogError::Network(e) => write!(f, "Network error: {}", e),
            DialogError::Api { status, message } => {
                write!(f, "Dialog API error ({}): {}", status, message)
            }
            DialogError::Parse(e) => write!(f, "Failed to parse dialog response: {}", e),
            DialogError::MissingToken => write!(f, "Login response carried no access token"),
            DialogError::EmptyClassification => write!(f, "Dialog result has no classification"),
        }
    }
}

impl std::error::Error for DialogError {}

/// Who the dialog backend is talking to. Supplied by session setup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialogIdentity {
    pub device_id: String,
    pub user_id: String,
}

impl DialogIdentity {
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// One augmentation job
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentRequest {
    pub session_id: String,
    pub identity: DialogIdentity,
    pub utterance: String,
}

/// Turns an utterance into augmented text.
///
/// Implementations resolve to `None` on any failure; they must not panic and
/// never surface errors to the relay.
pub trait Augmentor: Send + Sync {
    fn augment(&self, request: AugmentRequest) -> BoxFuture<'static, Option<String>>;
}
