pub mod attachments;
pub mod blob;
pub mod engine;
pub mod errors;
pub mod ids;
pub mod messages;

pub use attachments::{AttachmentDescriptor, AttachmentKind};
pub use errors::{AttachmentError, EngineError};
pub use ids::{AttachmentId, ConversationId, ToolInvocationId, TurnId};
pub use messages::{EngineContent, EngineTurn, Role, ToolCall, ToolCalls, ToolDefinition};
