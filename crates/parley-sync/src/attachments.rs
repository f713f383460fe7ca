//! Attachment normalization in both directions.
//!
//! Inbound, heterogeneous sources collapse into a flat, ordered list of
//! [`AttachmentDescriptor`]s. A source that cannot be converted is skipped
//! with a warning; the rest of the batch still goes through. Outbound, stored
//! blobs stream in `chunk_size` pieces into a single buffer capped at
//! `max_bytes`; a download that runs past the cap is abandoned mid-stream.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use tracing::{debug, warn};

use parley_core::attachments::AttachmentDescriptor;
use parley_core::blob::StoredBlob;
use parley_core::errors::AttachmentError;
use parley_core::messages::EngineContent;

use crate::settings::AttachmentSettings;

/// Anything a caller may hand in as an attachment.
#[derive(Clone)]
pub enum AttachmentSource {
    /// Raw bytes with a filename. A missing MIME type is guessed from the name.
    Bytes {
        bytes: Bytes,
        filename: String,
        mime_type: Option<String>,
    },
    /// A file on disk.
    Path(PathBuf),
    /// An already-normalized descriptor.
    Descriptor(AttachmentDescriptor),
    /// A blob that already lives in a blob store.
    Stored(Arc<dyn StoredBlob>),
    /// An already-attached collection of stored blobs.
    Attached(Vec<Arc<dyn StoredBlob>>),
    /// A list of sources, flattened in order.
    Many(Vec<AttachmentSource>),
    /// A keyed mapping, flattened in enumeration order.
    Keyed(IndexMap<String, AttachmentSource>),
    /// Anything else. Never convertible.
    Other(serde_json::Value),
}

impl AttachmentSource {
    pub fn bytes(bytes: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        Self::Bytes {
            bytes: bytes.into(),
            filename: filename.into(),
            mime_type: None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Bytes { .. } => "bytes",
            Self::Path(_) => "path",
            Self::Descriptor(_) => "descriptor",
            Self::Stored(_) => "stored blob",
            Self::Attached(_) => "attached collection",
            Self::Many(_) => "list",
            Self::Keyed(_) => "mapping",
            Self::Other(_) => "unrecognized value",
        }
    }
}

impl fmt::Debug for AttachmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes { filename, bytes, .. } => write!(f, "Bytes({filename}, {} bytes)", bytes.len()),
            Self::Path(path) => write!(f, "Path({})", path.display()),
            Self::Descriptor(d) => write!(f, "Descriptor({})", d.filename),
            Self::Stored(blob) => write!(f, "Stored({})", blob.filename()),
            Self::Attached(blobs) => write!(f, "Attached({} blobs)", blobs.len()),
            Self::Many(items) => f.debug_list().entries(items).finish(),
            Self::Keyed(map) => f.debug_map().entries(map.iter()).finish(),
            Self::Other(value) => write!(f, "Other({value})"),
        }
    }
}

impl From<PathBuf> for AttachmentSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for AttachmentSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<AttachmentDescriptor> for AttachmentSource {
    fn from(descriptor: AttachmentDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

impl From<Arc<dyn StoredBlob>> for AttachmentSource {
    fn from(blob: Arc<dyn StoredBlob>) -> Self {
        Self::Stored(blob)
    }
}

impl<T: Into<AttachmentSource>> From<Vec<T>> for AttachmentSource {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<AttachmentSource>> FromIterator<(K, V)> for AttachmentSource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Keyed(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<serde_json::Value> for AttachmentSource {
    fn from(value: serde_json::Value) -> Self {
        Self::Other(value)
    }
}

#[derive(Clone, Debug)]
pub struct AttachmentNormalizer {
    chunk_size: usize,
    max_bytes: u64,
}

impl Default for AttachmentNormalizer {
    fn default() -> Self {
        Self::new(&AttachmentSettings::default())
    }
}

impl AttachmentNormalizer {
    pub fn new(settings: &AttachmentSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size.max(1),
            max_bytes: settings.max_bytes,
        }
    }

    /// Flatten a source into descriptors in order. Blank results are dropped
    /// and unconvertible sources are skipped.
    pub fn normalize(&self, source: &AttachmentSource) -> Vec<AttachmentDescriptor> {
        let mut out = Vec::new();
        self.collect(source, &mut out);
        out
    }

    fn collect(&self, source: &AttachmentSource, out: &mut Vec<AttachmentDescriptor>) {
        match source {
            AttachmentSource::Many(items) => {
                for item in items {
                    self.collect(item, out);
                }
            }
            AttachmentSource::Keyed(map) => {
                for item in map.values() {
                    self.collect(item, out);
                }
            }
            AttachmentSource::Attached(blobs) => {
                for blob in blobs {
                    self.push(self.fetch(blob.as_ref()), "stored blob", out);
                }
            }
            single => self.push(self.convert(single), single.label(), out),
        }
    }

    fn push(
        &self,
        result: Result<AttachmentDescriptor, AttachmentError>,
        label: &str,
        out: &mut Vec<AttachmentDescriptor>,
    ) {
        match result {
            Ok(descriptor) if descriptor.is_empty() => {
                debug!(filename = %descriptor.filename, "dropping empty attachment");
            }
            Ok(descriptor) => out.push(descriptor),
            Err(e) => warn!(source = label, error = %e, "skipping attachment"),
        }
    }

    fn convert(&self, source: &AttachmentSource) -> Result<AttachmentDescriptor, AttachmentError> {
        match source {
            AttachmentSource::Bytes {
                bytes,
                filename,
                mime_type,
            } => {
                self.check_size(filename, bytes.len() as u64)?;
                Ok(AttachmentDescriptor::new(bytes.clone(), filename.clone(), mime_type.as_deref()))
            }
            AttachmentSource::Path(path) => self.read_path(path),
            AttachmentSource::Descriptor(descriptor) => {
                self.check_size(&descriptor.filename, descriptor.len() as u64)?;
                Ok(descriptor.clone())
            }
            AttachmentSource::Stored(blob) => self.fetch(blob.as_ref()),
            other => Err(AttachmentError::UnsupportedSource(format!("{other:?}"))),
        }
    }

    fn read_path(&self, path: &Path) -> Result<AttachmentDescriptor, AttachmentError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AttachmentError::UnsupportedSource(format!("path without file name: {}", path.display())))?;
        let file = File::open(path)?;
        self.check_size(&filename, file.metadata()?.len())?;

        let mut bytes = Vec::new();
        let _ = file.take(self.max_bytes.saturating_add(1)).read_to_end(&mut bytes)?;
        self.check_size(&filename, bytes.len() as u64)?;
        Ok(AttachmentDescriptor::new(bytes, filename, None))
    }

    /// Download a stored blob chunk by chunk. Memory never exceeds
    /// `max_bytes`, even if the blob is larger than its recorded size.
    pub fn fetch(&self, blob: &dyn StoredBlob) -> Result<AttachmentDescriptor, AttachmentError> {
        self.check_size(blob.filename(), blob.byte_size())?;

        let max_bytes = self.max_bytes;
        let mut buf = BytesMut::with_capacity(usize::try_from(blob.byte_size()).unwrap_or_default());
        blob.download(self.chunk_size, &mut |chunk| {
            if (buf.len() + chunk.len()) as u64 > max_bytes {
                return Err(std::io::Error::other("blob grew past the attachment limit"));
            }
            buf.extend_from_slice(chunk);
            Ok(())
        })?;

        Ok(AttachmentDescriptor::new(buf.freeze(), blob.filename(), Some(blob.mime_type())))
    }

    /// Rebuild engine content for a persisted turn. Blobs that fail to download
    /// are left out.
    pub fn to_engine_content<B: StoredBlob>(&self, text: &str, blobs: &[B]) -> EngineContent {
        let mut content = EngineContent::text(text);
        for blob in blobs {
            self.push(self.fetch(blob), "stored blob", &mut content.attachments);
        }
        content
    }

    fn check_size(&self, filename: &str, len: u64) -> Result<(), AttachmentError> {
        if len > self.max_bytes {
            return Err(AttachmentError::TooLarge {
                filename: filename.to_string(),
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}
