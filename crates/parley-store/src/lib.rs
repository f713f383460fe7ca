pub mod blobs;
pub mod conversations;
pub mod database;
pub mod error;
pub mod records;
pub mod row_helpers;
pub mod schema;
pub mod store;
pub mod tool_invocations;
pub mod turns;

pub use blobs::{SqliteBlob, SqliteBlobStore};
pub use database::Database;
pub use error::StoreError;
pub use records::{
    Arguments, ChatStore, ConversationRecord, ConversationRow, NewToolInvocation, ToolInvocationRecord,
    ToolInvocationRow, TurnFields, TurnRecord, TurnRow, TurnState, TurnWrite,
};
pub use store::SqliteChatStore;
