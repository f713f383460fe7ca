use parley_core::attachments::AttachmentKind;
use parley_core::errors::{AttachmentError, EngineError};
use parley_store::StoreError;

use crate::settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    /// Outbound formatting met a kind the provider cannot accept. Not retried.
    #[error("{provider} does not accept {kind} attachments")]
    UnsupportedAttachmentKind { kind: AttachmentKind, provider: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl SyncError {
    /// Engine failure classification, when this error came from the engine.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(e) => Some(e),
            _ => None,
        }
    }
}
