use thiserror::Error;

/// An error produced by a resource fetch.
///
/// Errors are cloned to every caller that coalesced onto the same fetch.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The transport answered with a non-successful status.
    #[error("fetch failed with status {code}: {message}")]
    Status { code: u16, message: String },
    /// The transport itself failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The resource refers to a model key that was never registered.
    #[error("no model registered for `{0}`")]
    UnknownModel(String),
    /// The fetch computation was dropped before it completed.
    #[error("fetch was canceled")]
    Canceled,
}

impl FetchError {
    /// The status code to surface for this error, if the transport reported one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}
