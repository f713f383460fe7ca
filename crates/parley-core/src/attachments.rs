//! Canonical attachment form shared by storage and engine-facing content.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical kind of an attachment, inferred from its MIME type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Pdf,
    Audio,
    Text,
    Unknown,
}

/// `application/*` types whose body is plain text.
const TEXTUAL_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-yaml",
    "application/yaml",
    "application/toml",
    "application/x-sh",
    "application/sql",
];

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let essence = mime_essence(mime_type);
        if essence.starts_with("image/") {
            Self::Image
        } else if essence == "application/pdf" {
            Self::Pdf
        } else if essence.starts_with("audio/") {
            Self::Audio
        } else if essence.starts_with("text/") || TEXTUAL_APPLICATION_TYPES.contains(&essence.as_str()) {
            Self::Text
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercased MIME type without parameters (`text/plain; charset=utf-8` -> `text/plain`).
pub fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Guess a MIME type from a filename, falling back to `application/octet-stream`.
pub fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Normalized `{bytes, filename, MIME type}` attachment.
///
/// Used both as the input to blob storage and as the typed attachment handed
/// to the conversation engine. `kind` is derived once from `mime_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentDescriptor {
    pub bytes: Bytes,
    pub filename: String,
    pub mime_type: String,
    pub kind: AttachmentKind,
}

impl AttachmentDescriptor {
    /// Build a descriptor. A missing or blank MIME type is guessed from the filename.
    pub fn new(bytes: impl Into<Bytes>, filename: impl Into<String>, mime_type: Option<&str>) -> Self {
        let filename = filename.into();
        let mime_type = match mime_type.map(str::trim) {
            Some(m) if !m.is_empty() => mime_essence(m),
            _ => guess_mime(&filename),
        };
        let kind = AttachmentKind::from_mime(&mime_type);
        Self {
            bytes: bytes.into(),
            filename,
            mime_type,
            kind,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mime() {
        assert_eq!(AttachmentKind::from_mime("image/png"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("application/pdf"), AttachmentKind::Pdf);
        assert_eq!(AttachmentKind::from_mime("audio/wav"), AttachmentKind::Audio);
        assert_eq!(AttachmentKind::from_mime("text/plain; charset=utf-8"), AttachmentKind::Text);
        assert_eq!(AttachmentKind::from_mime("application/json"), AttachmentKind::Text);
        assert_eq!(AttachmentKind::from_mime("application/zip"), AttachmentKind::Unknown);
        assert_eq!(AttachmentKind::from_mime(""), AttachmentKind::Unknown);
    }

    #[test]
    fn mime_is_case_insensitive() {
        assert_eq!(AttachmentKind::from_mime("IMAGE/JPEG"), AttachmentKind::Image);
    }

    #[test]
    fn descriptor_guesses_mime_from_filename() {
        let d = AttachmentDescriptor::new(vec![1, 2, 3], "ruby.png", None);
        assert_eq!(d.mime_type, "image/png");
        assert_eq!(d.kind, AttachmentKind::Image);

        let d = AttachmentDescriptor::new(vec![1], "sample.pdf", Some("  "));
        assert_eq!(d.mime_type, "application/pdf");
        assert_eq!(d.kind, AttachmentKind::Pdf);
    }

    #[test]
    fn descriptor_keeps_explicit_mime() {
        let d = AttachmentDescriptor::new(b"hi".to_vec(), "notes", Some("text/markdown; charset=utf-8"));
        assert_eq!(d.mime_type, "text/markdown");
        assert_eq!(d.kind, AttachmentKind::Text);
        assert_eq!(d.text_lossy(), "hi");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        let d = AttachmentDescriptor::new(vec![0], "blob.zzqx", None);
        assert_eq!(d.mime_type, "application/octet-stream");
        assert_eq!(d.kind, AttachmentKind::Unknown);
    }
}
