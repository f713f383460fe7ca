//! Synchronization between persisted conversations and a stateless
//! conversation engine.

pub mod attachments;
pub mod correlator;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod media;
pub mod mock;
pub mod settings;

pub use attachments::{AttachmentNormalizer, AttachmentSource};
pub use correlator::ToolCallCorrelator;
pub use error::SyncError;
pub use lifecycle::MessageLifecycle;
pub use manager::{BoundSession, ChatSync};
pub use media::{format_content, ContentPart, ProviderProfile};
pub use settings::{load_settings, AttachmentSettings, SettingsError, SyncSettings};
