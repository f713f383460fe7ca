//! Contract for the blob store that holds attachment bytes.

use std::io;

use crate::attachments::{AttachmentDescriptor, AttachmentKind};
use crate::errors::AttachmentError;
use crate::ids::TurnId;

/// A stored attachment. Content is only reachable through chunked download.
pub trait StoredBlob: Send + Sync {
    fn filename(&self) -> &str;
    fn mime_type(&self) -> &str;
    fn byte_size(&self) -> u64;

    /// Stream the content in pieces of at most `chunk_size` bytes.
    fn download(
        &self,
        chunk_size: usize,
        on_chunk: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<(), AttachmentError>;

    fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_mime(self.mime_type())
    }
}

/// Persists attachments against the Turn that owns them.
pub trait BlobStore: Send + Sync {
    type Blob: StoredBlob + Clone + 'static;

    /// Store descriptors in order, returning one reference per descriptor.
    fn attach(&self, owner: &TurnId, descriptors: &[AttachmentDescriptor]) -> Result<Vec<Self::Blob>, AttachmentError>;

    /// Attachments owned by a Turn, in attachment order.
    fn attachments(&self, owner: &TurnId) -> Result<Vec<Self::Blob>, AttachmentError>;
}
