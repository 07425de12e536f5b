//! SQLite record store.
//!
//! [`Store`] wraps a [`SqlitePool`] and owns every SQL statement in the
//! crate: patient identity rows, documents, images, chat history and
//! per-file checkpoints. Lookups that find nothing return `None` or an
//! empty `Vec`; only storage failures surface as errors.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{
    ChatMessage, DatabaseStats, Document, FileStatus, Image, NewDocument, NewImage, Patient,
    PatientDocumentEntry, PatientMatch, PatientRecord, PatientSummary,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Escape `%`, `_` and `\` so user text is matched literally by `LIKE`.
fn like_pattern(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('%');
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn parse_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::json!({}))
}

fn row_to_patient(row: &SqliteRow) -> Patient {
    Patient {
        id: row.get("id"),
        display_name: row.get("display_name"),
        external_id: row.get("external_id"),
        normalized_name: row.get("normalized_name"),
        normalized_id: row.get("normalized_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_document(row: &SqliteRow) -> Document {
    let metadata_json: String = row.get("metadata_json");
    Document {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        source_path: row.get("source_path"),
        file_name: row.get("file_name"),
        file_type: row.get("file_type"),
        content_hash: row.get("content_hash"),
        content: row.get("content"),
        processed_content: row.get("processed_content"),
        metadata: parse_metadata(&metadata_json),
        created_at: row.get("created_at"),
    }
}

fn row_to_image(row: &SqliteRow) -> Image {
    let metadata_json: String = row.get("metadata_json");
    Image {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        source_path: row.get("source_path"),
        file_name: row.get("file_name"),
        content_hash: row.get("content_hash"),
        transcription: row.get("transcription"),
        category: row.get("category"),
        metadata: parse_metadata(&metadata_json),
        created_at: row.get("created_at"),
    }
}

const PATIENT_COLUMNS: &str =
    "id, display_name, external_id, normalized_name, normalized_id, created_at, updated_at";

impl Store {
    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Patients ────────────────────────────────────────────────────────

    pub async fn insert_patient(
        &self,
        display_name: &str,
        external_id: Option<&str>,
        normalized_name: &str,
        normalized_id: &str,
    ) -> Result<i64> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO patients (display_name, external_id, normalized_name, normalized_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(display_name)
        .bind(external_id)
        .bind(normalized_name)
        .bind(normalized_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Exact key lookup: same normalized name, and the stored id is either
    /// empty or equal to `normalized_id`.
    pub async fn find_patient_exact(
        &self,
        normalized_name: &str,
        normalized_id: &str,
    ) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM patients
            WHERE normalized_name = ? AND (normalized_id = ? OR normalized_id = '')
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(normalized_name)
        .bind(normalized_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn touch_patient(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE patients SET updated_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every patient, oldest first.
    pub async fn all_patients(&self) -> Result<Vec<Patient>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM patients ORDER BY id ASC",
            PATIENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_patient).collect())
    }

    pub async fn get_patient(&self, id: i64) -> Result<Option<Patient>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM patients WHERE id = ?",
            PATIENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_patient))
    }

    pub async fn find_patient_by_normalized_id(&self, normalized_id: &str) -> Result<Option<Patient>> {
        if normalized_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT {} FROM patients WHERE normalized_id = ? ORDER BY id ASC LIMIT 1",
            PATIENT_COLUMNS
        ))
        .bind(normalized_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_patient))
    }

    pub async fn find_patient_by_normalized_name(
        &self,
        normalized_name: &str,
    ) -> Result<Option<Patient>> {
        if normalized_name.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT {} FROM patients WHERE normalized_name = ? ORDER BY id ASC LIMIT 1",
            PATIENT_COLUMNS
        ))
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_patient))
    }

    /// The patient plus every document and image, newest first.
    pub async fn patient_record(&self, id: i64) -> Result<Option<PatientRecord>> {
        let patient = match self.get_patient(id).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        let doc_rows = sqlx::query(
            r#"
            SELECT id, patient_id, source_path, file_name, file_type, content_hash, content,
                   processed_content, metadata_json, created_at
            FROM documents
            WHERE patient_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let image_rows = sqlx::query(
            r#"
            SELECT id, patient_id, source_path, file_name, content_hash, transcription, category,
                   metadata_json, created_at
            FROM images
            WHERE patient_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(PatientRecord {
            patient,
            documents: doc_rows.iter().map(row_to_document).collect(),
            images: image_rows.iter().map(row_to_image).collect(),
        }))
    }

    /// Roster with record counts, newest patient first.
    pub async fn list_patients(&self) -> Result<Vec<PatientSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.display_name, p.external_id, p.created_at,
                   (SELECT COUNT(*) FROM documents d WHERE d.patient_id = p.id) AS doc_count,
                   (SELECT COUNT(*) FROM images i WHERE i.patient_id = p.id) AS image_count
            FROM patients p
            ORDER BY p.created_at DESC, p.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PatientSummary {
                id: row.get("id"),
                display_name: row.get("display_name"),
                external_id: row.get("external_id"),
                created_at: row.get("created_at"),
                document_count: row.get("doc_count"),
                image_count: row.get("image_count"),
            })
            .collect())
    }

    /// Substring search over normalized identity fields and raw record text.
    ///
    /// `normalized_query` is matched against normalized name/id; `raw_query`
    /// against document content and image transcriptions.
    pub async fn search_patients(
        &self,
        normalized_query: &str,
        raw_query: &str,
    ) -> Result<Vec<PatientMatch>> {
        let raw_query = raw_query.trim();
        if normalized_query.is_empty() && raw_query.is_empty() {
            return Ok(Vec::new());
        }

        // An empty pattern would match every row.
        let norm_pat = if normalized_query.is_empty() {
            None
        } else {
            Some(like_pattern(normalized_query))
        };
        let raw_pat = if raw_query.is_empty() {
            None
        } else {
            Some(like_pattern(raw_query))
        };

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.id, p.display_name, p.external_id, p.created_at
            FROM patients p
            LEFT JOIN documents d ON p.id = d.patient_id
            LEFT JOIN images i ON p.id = i.patient_id
            WHERE p.normalized_name LIKE ?1 ESCAPE '\'
               OR p.normalized_id LIKE ?1 ESCAPE '\'
               OR d.content LIKE ?2 ESCAPE '\'
               OR i.transcription LIKE ?2 ESCAPE '\'
            ORDER BY p.display_name ASC, p.id ASC
            "#,
        )
        .bind(norm_pat)
        .bind(raw_pat)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PatientMatch {
                id: row.get("id"),
                display_name: row.get("display_name"),
                external_id: row.get("external_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ── Documents & images ──────────────────────────────────────────────

    /// Insert or update a document keyed by content hash. Older documents
    /// from the same source path with a different hash are removed so a
    /// changed file never leaves stale copies behind.
    pub async fn upsert_document(&self, doc: &NewDocument) -> Result<i64> {
        let now = now_ts();
        let metadata_json = doc.metadata.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (patient_id, source_path, file_name, file_type, content_hash,
                                   content, processed_content, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                patient_id = excluded.patient_id,
                source_path = excluded.source_path,
                file_name = excluded.file_name,
                file_type = excluded.file_type,
                content = excluded.content,
                processed_content = excluded.processed_content,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(doc.patient_id)
        .bind(&doc.source_path)
        .bind(&doc.file_name)
        .bind(&doc.file_type)
        .bind(&doc.content_hash)
        .bind(&doc.content)
        .bind(&doc.processed_content)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM documents WHERE source_path = ? AND content_hash != ?")
            .bind(&doc.source_path)
            .bind(&doc.content_hash)
            .execute(&mut *tx)
            .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM documents WHERE content_hash = ?")
            .bind(&doc.content_hash)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Same upsert rules as [`Store::upsert_document`].
    pub async fn upsert_image(&self, image: &NewImage) -> Result<i64> {
        let now = now_ts();
        let metadata_json = image.metadata.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO images (patient_id, source_path, file_name, content_hash, transcription,
                                category, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                patient_id = excluded.patient_id,
                source_path = excluded.source_path,
                file_name = excluded.file_name,
                transcription = excluded.transcription,
                category = excluded.category,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(image.patient_id)
        .bind(&image.source_path)
        .bind(&image.file_name)
        .bind(&image.content_hash)
        .bind(&image.transcription)
        .bind(&image.category)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM images WHERE source_path = ? AND content_hash != ?")
            .bind(&image.source_path)
            .bind(&image.content_hash)
            .execute(&mut *tx)
            .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM images WHERE content_hash = ?")
            .bind(&image.content_hash)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Owner of an already-analysed image, if one is stored under this hash.
    pub async fn image_owner(&self, content_hash: &str) -> Result<Option<Option<i64>>> {
        let owner: Option<Option<i64>> =
            sqlx::query_scalar("SELECT patient_id FROM images WHERE content_hash = ?")
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner)
    }

    /// Every document with its owner, newest patient first, capped at `limit`.
    /// Returns the entries and the uncapped total.
    pub async fn aggregate_entries(&self, limit: usize) -> Result<(Vec<PatientDocumentEntry>, i64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents d JOIN patients p ON p.id = d.patient_id",
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT p.display_name, p.external_id, d.content, d.processed_content
            FROM documents d
            JOIN patients p ON p.id = d.patient_id
            ORDER BY p.created_at DESC, p.id DESC, d.created_at DESC, d.id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(|row| {
                let content: String = row.get("content");
                let processed: Option<String> = row.get("processed_content");
                PatientDocumentEntry {
                    display_name: row.get("display_name"),
                    external_id: row.get("external_id"),
                    text: processed
                        .filter(|p| !p.trim().is_empty())
                        .unwrap_or(content),
                }
            })
            .collect();

        Ok((entries, total))
    }

    // ── Chat history ────────────────────────────────────────────────────

    pub async fn add_chat_message(
        &self,
        session_id: &str,
        message: &str,
        response: &str,
        patient_context: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, message, response, patient_context, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(message)
        .bind(response)
        .bind(patient_context)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chat_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, message, response, patient_context, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChatMessage {
                session_id: row.get("session_id"),
                message: row.get("message"),
                response: row.get("response"),
                patient_context: row.get("patient_context"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ── Checkpoints ─────────────────────────────────────────────────────

    pub async fn file_status(&self, path: &str) -> Result<Option<FileStatus>> {
        let row = sqlx::query(
            "SELECT path, content_hash, mtime_ns, processed_at FROM file_status WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FileStatus {
            path: row.get("path"),
            content_hash: row.get("content_hash"),
            mtime_ns: row.get("mtime_ns"),
            processed_at: row.get("processed_at"),
        }))
    }

    /// True iff a checkpoint exists with both the same hash and mtime.
    pub async fn is_file_processed(&self, path: &str, content_hash: &str, mtime_ns: i64) -> Result<bool> {
        Ok(self
            .file_status(path)
            .await?
            .map(|s| s.content_hash == content_hash && s.mtime_ns == mtime_ns)
            .unwrap_or(false))
    }

    pub async fn mark_file_processed(&self, path: &str, content_hash: &str, mtime_ns: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_status (path, content_hash, mtime_ns, processed_at, status)
            VALUES (?, ?, ?, ?, 'processed')
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                mtime_ns = excluded.mtime_ns,
                processed_at = excluded.processed_at,
                status = excluded.status
            "#,
        )
        .bind(path)
        .bind(content_hash)
        .bind(mtime_ns)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Whole-store operations ──────────────────────────────────────────

    pub async fn stats(&self) -> Result<DatabaseStats> {
        let total_patients: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patients")
            .fetch_one(&self.pool)
            .await?;
        let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let total_images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        let processed_files: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_status WHERE status = 'processed'")
                .fetch_one(&self.pool)
                .await?;

        Ok(DatabaseStats {
            total_patients,
            total_documents,
            total_images,
            processed_files,
        })
    }

    /// `(file_type, count)` for documents and `(category, count)` for images,
    /// largest first.
    pub async fn breakdown(&self) -> Result<(Vec<(String, i64)>, Vec<(String, i64)>)> {
        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT file_type, COUNT(*) AS n FROM documents GROUP BY file_type ORDER BY n DESC, file_type",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_category: Vec<(String, i64)> = sqlx::query_as(
            "SELECT category, COUNT(*) AS n FROM images GROUP BY category ORDER BY n DESC, category",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok((by_type, by_category))
    }

    /// Time of the most recent checkpoint, if any file has been processed.
    pub async fn last_processed_at(&self) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(processed_at) FROM file_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }

    /// Delete every record and checkpoint in one transaction.
    pub async fn reset_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["images", "documents", "patients", "chat_messages", "file_status"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let store = Store::open(&config).await.unwrap();
        (tmp, store)
    }

    fn doc(source: &str, hash: &str, patient_id: i64) -> NewDocument {
        NewDocument {
            patient_id: Some(patient_id),
            source_path: source.to_string(),
            file_name: "clinical_data.csv".to_string(),
            file_type: "clinical_record".to_string(),
            content_hash: hash.to_string(),
            content: format!("note {}", hash),
            processed_content: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a%b_c"), "%a\\%b\\_c%");
    }

    #[tokio::test]
    async fn upsert_by_hash_does_not_duplicate() {
        let (_tmp, store) = open_store().await;
        let pid = store.insert_patient("Alice", None, "alice", "").await.unwrap();

        let first = store.upsert_document(&doc("s.csv#row_0", "h1", pid)).await.unwrap();
        let second = store.upsert_document(&doc("s.csv#row_0", "h1", pid)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.stats().await.unwrap().total_documents, 1);
    }

    #[tokio::test]
    async fn changed_source_replaces_stale_document() {
        let (_tmp, store) = open_store().await;
        let pid = store.insert_patient("Alice", None, "alice", "").await.unwrap();

        store.upsert_document(&doc("s.csv#row_0", "old", pid)).await.unwrap();
        store.upsert_document(&doc("s.csv#row_0", "new", pid)).await.unwrap();

        let record = store.patient_record(pid).await.unwrap().unwrap();
        assert_eq!(record.documents.len(), 1);
        assert_eq!(record.documents[0].content_hash, "new");
    }

    #[tokio::test]
    async fn patient_record_keeps_the_newest_documents_first() {
        use crate::config::ContextConfig;
        use crate::context::format_patient_context;

        let (_tmp, store) = open_store().await;
        let pid = store.insert_patient("Alice", None, "alice", "").await.unwrap();

        // Creation times deliberately disagree with insertion order.
        let mut ranks = Vec::new();
        for i in 0..15i64 {
            let hash = format!("d{:02}", i);
            let source = format!("s.csv#row_{}", i);
            let id = store.upsert_document(&doc(&source, &hash, pid)).await.unwrap();
            let rank = (i * 7) % 15;
            sqlx::query("UPDATE documents SET created_at = ? WHERE id = ?")
                .bind(1_700_000_000 + rank * 60)
                .bind(id)
                .execute(&store.pool)
                .await
                .unwrap();
            ranks.push((rank, hash));
        }
        ranks.sort_by(|a, b| b.0.cmp(&a.0));
        let newest: Vec<String> = ranks.iter().take(10).map(|(_, h)| h.clone()).collect();
        let oldest: Vec<String> = ranks.iter().skip(10).map(|(_, h)| h.clone()).collect();

        let record = store.patient_record(pid).await.unwrap().unwrap();
        let order: Vec<String> = record
            .documents
            .iter()
            .map(|d| d.content_hash.clone())
            .collect();
        assert_eq!(&order[..10], &newest[..]);

        let text = format_patient_context(&record, &ContextConfig::default());
        for hash in &newest {
            assert!(text.contains(&format!("note {}", hash)), "missing {}", hash);
        }
        for hash in &oldest {
            assert!(!text.contains(&format!("note {}", hash)), "unexpected {}", hash);
        }
        assert!(text.contains("... and 5 more documents"));
    }

    #[tokio::test]
    async fn checkpoint_requires_hash_and_mtime() {
        let (_tmp, store) = open_store().await;
        assert!(!store.is_file_processed("a.csv", "h", 1).await.unwrap());

        store.mark_file_processed("a.csv", "h", 1).await.unwrap();
        assert!(store.is_file_processed("a.csv", "h", 1).await.unwrap());
        assert!(!store.is_file_processed("a.csv", "h", 2).await.unwrap());
        assert!(!store.is_file_processed("a.csv", "h2", 1).await.unwrap());
    }

    #[tokio::test]
    async fn search_matches_identity_and_content() {
        let (_tmp, store) = open_store().await;
        let alice = store.insert_patient("Alice Moore", Some("M0001"), "alicemoore", "m0001").await.unwrap();
        let bob = store.insert_patient("Bob Stone", None, "bobstone", "").await.unwrap();
        let mut d = doc("s.csv#row_1", "hb", bob);
        d.content = "Diagnosis: Asthma".to_string();
        store.upsert_document(&d).await.unwrap();

        let by_name = store.search_patients("alice", "alice").await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, alice);

        let by_content = store.search_patients("asthma", "asthma").await.unwrap();
        assert_eq!(by_content.len(), 1);
        assert_eq!(by_content[0].id, bob);

        assert!(store.search_patients("", "  ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let (_tmp, store) = open_store().await;
        let pid = store.insert_patient("Alice", None, "alice", "").await.unwrap();
        store.upsert_document(&doc("s.csv#row_0", "h1", pid)).await.unwrap();
        store.add_chat_message("s1", "hi", "hello", None).await.unwrap();
        store.mark_file_processed("s.csv", "h", 1).await.unwrap();

        store.reset_all().await.unwrap();
        assert_eq!(store.stats().await.unwrap(), DatabaseStats::default());
        assert!(store.chat_history("s1").await.unwrap().is_empty());
    }
}
