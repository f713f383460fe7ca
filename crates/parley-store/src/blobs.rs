//! SQLite-backed attachment storage.
//!
//! Content lives in the `attachments` table next to a SHA-256 checksum and is
//! read back through incremental blob I/O, so a download never materializes
//! the whole payload at once.

use std::fmt;
use std::io::Read;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use parley_core::attachments::AttachmentDescriptor;
use parley_core::blob::{BlobStore, StoredBlob};
use parley_core::errors::AttachmentError;
use parley_core::ids::{AttachmentId, TurnId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Reference to one stored attachment.
#[derive(Clone)]
pub struct SqliteBlob {
    id: AttachmentId,
    filename: String,
    mime_type: String,
    byte_size: u64,
    checksum: String,
    db: Database,
}

impl SqliteBlob {
    pub fn id(&self) -> &AttachmentId {
        &self.id
    }

    /// Hex SHA-256 of the content.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl fmt::Debug for SqliteBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBlob")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("byte_size", &self.byte_size)
            .finish_non_exhaustive()
    }
}

impl StoredBlob for SqliteBlob {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn byte_size(&self) -> u64 {
        self.byte_size
    }

    fn download(
        &self,
        chunk_size: usize,
        on_chunk: &mut dyn FnMut(&[u8]) -> std::io::Result<()>,
    ) -> Result<(), AttachmentError> {
        let chunk_size = chunk_size.max(1);
        self.db
            .with_conn(|conn| {
                // Implicit rowids are not stable across VACUUM; resolve per download.
                let rowid: i64 = conn
                    .query_row("SELECT rowid FROM attachments WHERE id = ?1", [self.id.as_str()], |row| row.get(0))
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("attachment {}", self.id)))?;
                let mut blob = conn.blob_open(DatabaseName::Main, "attachments", "content", rowid, true)?;
                let mut buf = vec![0u8; chunk_size];
                let mut hasher = Sha256::new();
                loop {
                    let n = blob.read(&mut buf).map_err(|e| StoreError::Io(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    on_chunk(&buf[..n]).map_err(|e| StoreError::Io(e.to_string()))?;
                }
                let digest = format!("{:x}", hasher.finalize());
                if digest != self.checksum {
                    return Err(StoreError::CorruptRow {
                        table: "attachments",
                        column: "content",
                        detail: format!("checksum mismatch for {}", self.id),
                    });
                }
                Ok(())
            })
            .map_err(|e| AttachmentError::Blob(e.to_string()))
    }
}

/// Blob store over the shared [`Database`].
#[derive(Clone)]
pub struct SqliteBlobStore {
    db: Database,
}

impl SqliteBlobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl BlobStore for SqliteBlobStore {
    type Blob = SqliteBlob;

    #[instrument(skip(self, descriptors), fields(turn_id = %owner, count = descriptors.len()))]
    fn attach(&self, owner: &TurnId, descriptors: &[AttachmentDescriptor]) -> Result<Vec<SqliteBlob>, AttachmentError> {
        self.db
            .with_tx(|tx| {
                let start: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM attachments WHERE turn_id = ?1",
                    [owner.as_str()],
                    |row| row.get(0),
                )?;
                let mut stored = Vec::with_capacity(descriptors.len());
                for (offset, descriptor) in (0i64..).zip(descriptors) {
                    stored.push(insert(tx, &self.db, owner, start + offset, descriptor)?);
                }
                Ok(stored)
            })
            .map_err(|e| AttachmentError::Blob(e.to_string()))
    }

    fn attachments(&self, owner: &TurnId) -> Result<Vec<SqliteBlob>, AttachmentError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, filename, mime_type, byte_size, checksum
                     FROM attachments WHERE turn_id = ?1 ORDER BY position ASC",
                )?;
                let mut rows = stmt.query([owner.as_str()])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    let byte_size: i64 = row_helpers::get(row, 3, "attachments", "byte_size")?;
                    results.push(SqliteBlob {
                        id: AttachmentId::from_raw(row_helpers::get::<String>(row, 0, "attachments", "id")?),
                        filename: row_helpers::get(row, 1, "attachments", "filename")?,
                        mime_type: row_helpers::get(row, 2, "attachments", "mime_type")?,
                        byte_size: u64::try_from(byte_size).map_err(|_| StoreError::CorruptRow {
                            table: "attachments",
                            column: "byte_size",
                            detail: format!("negative size {byte_size}"),
                        })?,
                        checksum: row_helpers::get(row, 4, "attachments", "checksum")?,
                        db: self.db.clone(),
                    });
                }
                Ok(results)
            })
            .map_err(|e| AttachmentError::Blob(e.to_string()))
    }
}

fn insert(
    conn: &Connection,
    db: &Database,
    owner: &TurnId,
    position: i64,
    descriptor: &AttachmentDescriptor,
) -> Result<SqliteBlob, StoreError> {
    let id = AttachmentId::new();
    let checksum = hex_sha256(&descriptor.bytes);
    let byte_size = descriptor.bytes.len() as u64;
    let _ = conn.execute(
        "INSERT INTO attachments (id, turn_id, position, filename, mime_type, byte_size, checksum, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.as_str(),
            owner.as_str(),
            position,
            descriptor.filename,
            descriptor.mime_type,
            i64::try_from(byte_size).unwrap_or(i64::MAX),
            checksum,
            &descriptor.bytes[..],
            row_helpers::timestamp(),
        ],
    )?;
    debug!(attachment_id = %id, filename = %descriptor.filename, byte_size, "attachment stored");
    Ok(SqliteBlob {
        id,
        filename: descriptor.filename.clone(),
        mime_type: descriptor.mime_type.clone(),
        byte_size,
        checksum,
        db: db.clone(),
    })
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
