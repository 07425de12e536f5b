//! Core data models used throughout medctx.
//!
//! These mirror the five tables of the record store plus the composite
//! shapes (a patient with all of their records, database statistics) that
//! the context assembler and CLI read.

use serde::Serialize;

/// Canonical patient identity.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Patient {
    pub id: i64,
    pub display_name: String,
    pub external_id: Option<String>,
    pub normalized_name: String,
    pub normalized_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A clinical note, spreadsheet row, or extracted file text.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub patient_id: Option<i64>,
    pub source_path: String,
    pub file_name: String,
    pub file_type: String,
    pub content_hash: String,
    pub content: String,
    pub processed_content: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl Document {
    /// Enhanced text when the summarizer produced one, raw text otherwise.
    pub fn best_text(&self) -> &str {
        match &self.processed_content {
            Some(p) if !p.trim().is_empty() => p,
            _ => &self.content,
        }
    }
}

/// A medical image and its transcription/analysis text.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub id: i64,
    pub patient_id: Option<i64>,
    pub source_path: String,
    pub file_name: String,
    pub content_hash: String,
    pub transcription: String,
    pub category: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// Input for a document upsert.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub patient_id: Option<i64>,
    pub source_path: String,
    pub file_name: String,
    pub file_type: String,
    pub content_hash: String,
    pub content: String,
    pub processed_content: Option<String>,
    pub metadata: serde_json::Value,
}

/// Input for an image upsert.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub patient_id: Option<i64>,
    pub source_path: String,
    pub file_name: String,
    pub content_hash: String,
    pub transcription: String,
    pub category: String,
    pub metadata: serde_json::Value,
}

/// Append-only chat audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub session_id: String,
    pub message: String,
    pub response: String,
    pub patient_context: Option<String>,
    pub created_at: i64,
}

/// Per-file processing checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStatus {
    pub path: String,
    pub content_hash: String,
    pub mtime_ns: i64,
    pub processed_at: i64,
}

/// A patient together with every document and image they own,
/// newest first.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub patient: Patient,
    pub documents: Vec<Document>,
    pub images: Vec<Image>,
}

/// Roster row with record counts.
#[derive(Debug, Clone, Serialize)]
pub struct PatientSummary {
    pub id: i64,
    pub display_name: String,
    pub external_id: Option<String>,
    pub created_at: i64,
    pub document_count: i64,
    pub image_count: i64,
}

/// Result of a roster substring search.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatientMatch {
    pub id: i64,
    pub display_name: String,
    pub external_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct DatabaseStats {
    pub total_patients: i64,
    pub total_documents: i64,
    pub total_images: i64,
    pub processed_files: i64,
}

/// One document row flattened with its owner, for aggregate context.
#[derive(Debug, Clone)]
pub struct PatientDocumentEntry {
    pub display_name: String,
    pub external_id: Option<String>,
    pub text: String,
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn format_ts_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
