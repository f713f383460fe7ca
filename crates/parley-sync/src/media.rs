//! Renders engine content into provider content parts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use parley_core::attachments::{AttachmentDescriptor, AttachmentKind};
use parley_core::messages::EngineContent;

use crate::error::SyncError;

/// Which attachment kinds a provider accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderProfile {
    pub name: String,
    pub accepts: Vec<AttachmentKind>,
}

impl ProviderProfile {
    pub fn new(name: impl Into<String>, accepts: &[AttachmentKind]) -> Self {
        Self {
            name: name.into(),
            accepts: accepts.to_vec(),
        }
    }

    /// OpenAI-style chat completions: images, PDFs, audio and text files.
    pub fn openai() -> Self {
        Self::new(
            "openai",
            &[AttachmentKind::Image, AttachmentKind::Pdf, AttachmentKind::Audio, AttachmentKind::Text],
        )
    }

    pub fn text_only(name: impl Into<String>) -> Self {
        Self::new(name, &[AttachmentKind::Text])
    }

    pub fn accepts(&self, kind: AttachmentKind) -> bool {
        self.accepts.contains(&kind)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
    InputAudio { input_audio: InputAudio },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputAudio {
    pub data: String,
    pub format: String,
}

/// Text first (when present), then one part per attachment in order.
pub fn format_content(content: &EngineContent, profile: &ProviderProfile) -> Result<Vec<ContentPart>, SyncError> {
    let mut parts = Vec::with_capacity(content.attachments.len() + 1);
    if !content.text.is_empty() {
        parts.push(ContentPart::Text {
            text: content.text.clone(),
        });
    }
    for attachment in &content.attachments {
        parts.push(format_attachment(attachment, profile)?);
    }
    Ok(parts)
}

pub fn format_attachment(
    attachment: &AttachmentDescriptor,
    profile: &ProviderProfile,
) -> Result<ContentPart, SyncError> {
    if !profile.accepts(attachment.kind) {
        return Err(SyncError::UnsupportedAttachmentKind {
            kind: attachment.kind,
            provider: profile.name.clone(),
        });
    }
    let part = match attachment.kind {
        AttachmentKind::Image => ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: data_uri(attachment),
            },
        },
        AttachmentKind::Pdf => ContentPart::File {
            file: FileData {
                filename: attachment.filename.clone(),
                file_data: data_uri(attachment),
            },
        },
        AttachmentKind::Audio => ContentPart::InputAudio {
            input_audio: InputAudio {
                data: STANDARD.encode(&attachment.bytes),
                format: audio_format(&attachment.mime_type),
            },
        },
        AttachmentKind::Text => ContentPart::Text {
            text: format!(
                "<file name='{}' mime_type='{}'>{}</file>",
                attachment.filename,
                attachment.mime_type,
                attachment.text_lossy()
            ),
        },
        AttachmentKind::Unknown => {
            return Err(SyncError::UnsupportedAttachmentKind {
                kind: AttachmentKind::Unknown,
                provider: profile.name.clone(),
            })
        }
    };
    Ok(part)
}

fn data_uri(attachment: &AttachmentDescriptor) -> String {
    format!("data:{};base64,{}", attachment.mime_type, STANDARD.encode(&attachment.bytes))
}

/// `audio/mpeg` -> `mp3`, otherwise the MIME subtype (`audio/wav` -> `wav`).
fn audio_format(mime_type: &str) -> String {
    match mime_type.split('/').nth(1).unwrap_or_default() {
        "mpeg" => "mp3".to_string(),
        "x-wav" | "wave" => "wav".to_string(),
        subtype => subtype.to_string(),
    }
}
