//! Metadata index.
//!
//! Append-only SQLite collection holding one ClipMetadataRecord per ingested
//! clip. Records are never mutated or deleted. The dedup key is UNIQUE so a
//! retried upload whose earlier call succeeded unacknowledged resolves to
//! the existing record instead of a duplicate row.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::domain::{
    ClipMetadataRecord, ClipType, CloseReason, EncodeStatus, TranscribeStatus,
    TranscriptProvenance,
};

/// Result of an insert
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub document_id: String,

    /// True when the dedup key already existed and the prior record was kept
    pub duplicate: bool,
}

/// SQLite-backed append-only metadata collection
pub struct MetadataIndex {
    conn: Mutex<Connection>,
    collection: String,
}

impl MetadataIndex {
    /// Open (or create) the index at the given path
    pub fn open(db_path: PathBuf, collection: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open index at {}", db_path.display()))?;

        let index = Self {
            conn: Mutex::new(conn),
            collection: sanitize_collection(collection)?,
        };
        index.create_table()?;

        tracing::info!(path = %db_path.display(), collection = %index.collection, "Metadata index ready");
        Ok(index)
    }

    /// In-memory index for tests
    pub fn open_in_memory(collection: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory index")?;
        let index = Self {
            conn: Mutex::new(conn),
            collection: sanitize_collection(collection)?,
        };
        index.create_table()?;
        Ok(index)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    document_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    dedup_key TEXT NOT NULL UNIQUE,
                    clip_name TEXT NOT NULL,
                    original_clip_name TEXT NOT NULL,
                    clip_type TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    original_mime_type TEXT NOT NULL,
                    size_bytes_original INTEGER NOT NULL,
                    size_bytes_encoded INTEGER NOT NULL,
                    clip_started_at TEXT NOT NULL,
                    clip_ended_at TEXT NOT NULL,
                    captured_at TEXT NOT NULL,
                    uploaded_at TEXT NOT NULL,
                    indexed_at TEXT NOT NULL,
                    storage_url TEXT NOT NULL,
                    storage_bucket TEXT NOT NULL,
                    storage_path TEXT NOT NULL,
                    transcript_text TEXT NOT NULL,
                    transcript_status TEXT NOT NULL,
                    transcript_engine TEXT,
                    transcript_model TEXT,
                    transcript_detail TEXT,
                    encode_status TEXT NOT NULL,
                    encode_detail TEXT
                )
                "#,
                self.collection
            ),
            [],
        )
        .context("Failed to create metadata collection")?;
        Ok(())
    }

    /// Append one record.
    ///
    /// If a record with the same dedup key already exists, the existing
    /// document id is returned and nothing is written.
    pub fn append(&self, record: &ClipMetadataRecord) -> Result<InsertOutcome> {
        let conn = self.conn.lock().unwrap();

        if let Some(existing) = self.find_by_dedup_key_locked(&conn, &record.dedup_key)? {
            tracing::info!(
                dedup_key = %record.dedup_key,
                document_id = %existing,
                "Duplicate clip upload, returning existing record"
            );
            return Ok(InsertOutcome {
                document_id: existing,
                duplicate: true,
            });
        }

        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (
                    document_id, session_id, dedup_key,
                    clip_name, original_clip_name, clip_type, reason,
                    mime_type, original_mime_type,
                    size_bytes_original, size_bytes_encoded,
                    clip_started_at, clip_ended_at, captured_at, uploaded_at, indexed_at,
                    storage_url, storage_bucket, storage_path,
                    transcript_text, transcript_status, transcript_engine,
                    transcript_model, transcript_detail,
                    encode_status, encode_detail
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
                )
                "#,
                self.collection
            ),
            params![
                record.document_id,
                record.session_id.to_string(),
                record.dedup_key,
                record.clip_name,
                record.original_clip_name,
                record.clip_type.as_str(),
                record.reason.as_str(),
                record.mime_type,
                record.original_mime_type,
                record.size_bytes_original as i64,
                record.size_bytes_encoded as i64,
                record.clip_started_at.to_rfc3339(),
                record.clip_ended_at.to_rfc3339(),
                record.captured_at.to_rfc3339(),
                record.uploaded_at.to_rfc3339(),
                record.indexed_at.to_rfc3339(),
                record.storage_url,
                record.storage_bucket,
                record.storage_path,
                record.transcript_text,
                transcript_status_str(&record.transcript.status),
                record.transcript.engine,
                record.transcript.model,
                record.transcript.detail,
                encode_status_str(&record.encode_status),
                record.encode_detail,
            ],
        )
        .context("Failed to append metadata record")?;

        Ok(InsertOutcome {
            document_id: record.document_id.clone(),
            duplicate: false,
        })
    }

    fn find_by_dedup_key_locked(
        &self,
        conn: &Connection,
        dedup_key: &str,
    ) -> Result<Option<String>> {
        conn.query_row(
            &format!(
                "SELECT document_id FROM {} WHERE dedup_key = ?1",
                self.collection
            ),
            params![dedup_key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query by dedup key")
    }

    /// Look up one record by dedup key
    pub fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<ClipMetadataRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT * FROM {} WHERE dedup_key = ?1",
                self.collection
            ),
            params![dedup_key],
            row_to_record,
        )
        .optional()
        .context("Failed to query by dedup key")
    }

    /// Look up one record by document id
    pub fn get(&self, document_id: &str) -> Result<Option<ClipMetadataRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT * FROM {} WHERE document_id = ?1",
                self.collection
            ),
            params![document_id],
            row_to_record,
        )
        .optional()
        .context("Failed to query record")
    }

    /// All records for one session, in index order
    pub fn records_for_session(&self, session_id: Uuid) -> Result<Vec<ClipMetadataRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE session_id = ?1 ORDER BY indexed_at",
            self.collection
        ))?;

        let records = stmt
            .query_map(params![session_id.to_string()], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read session records")?;

        Ok(records)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.collection),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Collection names come from config; restrict them to plain identifiers
fn sanitize_collection(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        anyhow::bail!("Invalid collection name: {}", name);
    }
    Ok(name.to_string())
}

fn transcript_status_str(status: &TranscribeStatus) -> &'static str {
    match status {
        TranscribeStatus::Transcribed => "transcribed",
        TranscribeStatus::NoCredential => "no_credential",
        TranscribeStatus::Failed => "failed",
    }
}

fn transcript_status_from(s: &str) -> TranscribeStatus {
    match s {
        "transcribed" => TranscribeStatus::Transcribed,
        "failed" => TranscribeStatus::Failed,
        _ => TranscribeStatus::NoCredential,
    }
}

fn encode_status_str(status: &EncodeStatus) -> &'static str {
    match status {
        EncodeStatus::Encoded => "encoded",
        EncodeStatus::PassThrough => "pass_through",
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClipMetadataRecord> {
    let parse_time = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let raw: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    };

    let session_raw: String = row.get(1)?;
    let session_id = Uuid::from_str(&session_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let clip_type_raw: String = row.get(5)?;
    let clip_type = match clip_type_raw.as_str() {
        "high-res" => ClipType::HighRes,
        _ => ClipType::LowRes,
    };

    let reason_raw: String = row.get(6)?;
    let reason = match reason_raw.as_str() {
        "stop" => CloseReason::Stop,
        "trigger_timeout" => CloseReason::TriggerTimeout,
        _ => CloseReason::FullWindow,
    };

    let transcript_status_raw: String = row.get(20)?;
    let encode_status_raw: String = row.get(24)?;

    Ok(ClipMetadataRecord {
        document_id: row.get(0)?,
        session_id,
        dedup_key: row.get(2)?,
        clip_name: row.get(3)?,
        original_clip_name: row.get(4)?,
        clip_type,
        reason,
        mime_type: row.get(7)?,
        original_mime_type: row.get(8)?,
        size_bytes_original: row.get::<_, i64>(9)? as u64,
        size_bytes_encoded: row.get::<_, i64>(10)? as u64,
        clip_started_at: parse_time(11)?,
        clip_ended_at: parse_time(12)?,
        captured_at: parse_time(13)?,
        uploaded_at: parse_time(14)?,
        indexed_at: parse_time(15)?,
        storage_url: row.get(16)?,
        storage_bucket: row.get(17)?,
        storage_path: row.get(18)?,
        transcript_text: row.get(19)?,
        transcript: TranscriptProvenance {
            status: transcript_status_from(&transcript_status_raw),
            engine: row.get(21)?,
            model: row.get(22)?,
            detail: row.get(23)?,
        },
        encode_status: match encode_status_raw.as_str() {
            "encoded" => EncodeStatus::Encoded,
            _ => EncodeStatus::PassThrough,
        },
        encode_detail: row.get(25)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(dedup_key: &str) -> ClipMetadataRecord {
        let now = Utc::now();
        ClipMetadataRecord {
            document_id: Uuid::new_v4().to_string(),
            session_id: Uuid::new_v4(),
            dedup_key: dedup_key.to_string(),
            clip_name: "low-0001.mp4".to_string(),
            original_clip_name: "low-0001.webm".to_string(),
            clip_type: ClipType::LowRes,
            reason: CloseReason::FullWindow,
            mime_type: "video/mp4".to_string(),
            original_mime_type: "video/webm".to_string(),
            size_bytes_original: 1000,
            size_bytes_encoded: 800,
            clip_started_at: now,
            clip_ended_at: now,
            captured_at: now,
            uploaded_at: now,
            indexed_at: now,
            storage_url: "http://127.0.0.1:8788/media/sessions/x/low-0001.mp4".to_string(),
            storage_bucket: "livecap-media".to_string(),
            storage_path: "sessions/x/low-0001.mp4".to_string(),
            transcript_text: "chop the onions".to_string(),
            transcript: TranscriptProvenance::transcribed("openai", "whisper-1"),
            encode_status: EncodeStatus::Encoded,
            encode_detail: None,
        }
    }

    #[test]
    fn test_append_and_get_round_trip() {
        let index = MetadataIndex::open_in_memory("media_metadata").unwrap();
        let record = test_record("abc123def456");

        let outcome = index.append(&record).unwrap();
        assert!(!outcome.duplicate);
        assert_eq!(outcome.document_id, record.document_id);

        let loaded = index.get(&record.document_id).unwrap().unwrap();
        assert_eq!(loaded.dedup_key, record.dedup_key);
        assert_eq!(loaded.transcript_text, "chop the onions");
        assert_eq!(loaded.clip_type, ClipType::LowRes);
        assert_eq!(loaded.transcript.status, TranscribeStatus::Transcribed);
        assert_eq!(loaded.size_bytes_encoded, 800);
    }

    #[test]
    fn test_duplicate_dedup_key_returns_existing() {
        let index = MetadataIndex::open_in_memory("media_metadata").unwrap();

        let first = test_record("samekey00001");
        let mut second = test_record("samekey00001");
        second.document_id = Uuid::new_v4().to_string();

        let outcome1 = index.append(&first).unwrap();
        let outcome2 = index.append(&second).unwrap();

        assert!(!outcome1.duplicate);
        assert!(outcome2.duplicate);
        assert_eq!(outcome2.document_id, first.document_id);
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn test_records_for_session() {
        let index = MetadataIndex::open_in_memory("media_metadata").unwrap();

        let mut a = test_record("key-a0000001");
        let mut b = test_record("key-b0000001");
        let session = Uuid::new_v4();
        a.session_id = session;
        b.session_id = session;

        index.append(&a).unwrap();
        index.append(&b).unwrap();
        index.append(&test_record("key-c0000001")).unwrap();

        let records = index.records_for_session(session).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(MetadataIndex::open_in_memory("media_metadata").is_ok());
        assert!(MetadataIndex::open_in_memory("bad; DROP TABLE x").is_err());
        assert!(MetadataIndex::open_in_memory("").is_err());
    }
}
