//! Ingestion pipeline orchestration.
//!
//! One run walks the dataset in this order:
//!
//! 1. find pending files (the primary spreadsheet and supplementary
//!    documents whose content hash or mtime differs from the checkpoint);
//! 2. for each spreadsheet row: resolve the patient, store the clinical note
//!    (with an enhanced variant when the generator is available), then
//!    analyze the associated image if the row names one;
//! 3. for each supplementary document: extract text, infer the patient,
//!    store, checkpoint.
//!
//! Failures are isolated to one row, image or file. They are logged,
//! collected in [`IngestSummary::errors`], and turn the run status into
//! `partial_success`. A file with failures is not checkpointed, so the next
//! run retries it; upserts keyed by content hash keep the retry idempotent.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::extract;
use crate::identity;
use crate::imaging::{self, ImageSubject};
use crate::llm::{self, GenerationError, Generator, Turn, VisionAnalyzer};
use crate::models::{DatabaseStats, NewDocument, NewImage};
use crate::ocr::{self, TextExtractor};
use crate::prompts::{enhance_prompt, ENHANCE_MAX_TOKENS, ENHANCE_TEMPERATURE};
use crate::scan::{self, Fingerprint};
use crate::spreadsheet::{self, ClinicalRow, ColumnMap};
use crate::store::Store;

/// Advisory guard against two runs through the same [`Pipeline`].
#[derive(Debug, Default)]
pub struct ProcessingFlag(AtomicBool);

impl ProcessingFlag {
    pub fn try_acquire(&self) -> Option<ProcessingGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessingGuard(&self.0))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::PartialSuccess => write!(f, "partial_success"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub status: RunStatus,
    pub dry_run: bool,
    pub files_processed: u64,
    pub rows: u64,
    pub documents: u64,
    pub images: u64,
    pub images_missing: u64,
    pub skipped_rows: u64,
    /// Files that would be processed (dry run) or were found pending.
    pub pending: Vec<String>,
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
}

impl Default for IngestSummary {
    fn default() -> Self {
        Self {
            status: RunStatus::Success,
            dry_run: false,
            files_processed: 0,
            rows: 0,
            documents: 0,
            images: 0,
            images_missing: 0,
            skipped_rows: 0,
            pending: Vec::new(),
            errors: Vec::new(),
            elapsed_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpreadsheetState {
    pub path: String,
    pub exists: bool,
    pub processed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub stats: DatabaseStats,
    pub spreadsheet: SpreadsheetState,
    pub pending: Vec<String>,
    /// Files that could not be read while computing `pending`.
    pub errors: Vec<String>,
    pub processing: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum FileKind {
    Spreadsheet,
    Document { relative: String },
}

struct PendingFile {
    path: PathBuf,
    kind: FileKind,
    bytes: Vec<u8>,
    fingerprint: Fingerprint,
}

#[derive(Default)]
struct PendingScan {
    files: Vec<PendingFile>,
    errors: Vec<String>,
}

async fn read_candidate(path: &Path) -> Result<(Vec<u8>, Fingerprint)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let fingerprint = scan::fingerprint(path, &bytes)?;
    Ok((bytes, fingerprint))
}

impl PendingFile {
    fn key(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct Pipeline {
    store: Store,
    config: Config,
    generator: Arc<dyn Generator>,
    vision: Arc<dyn VisionAnalyzer>,
    ocr: Arc<dyn TextExtractor>,
    processing: ProcessingFlag,
}

impl Pipeline {
    pub fn new(
        store: Store,
        config: Config,
        generator: Arc<dyn Generator>,
        vision: Arc<dyn VisionAnalyzer>,
        ocr: Arc<dyn TextExtractor>,
    ) -> Self {
        Self {
            store,
            config,
            generator,
            vision,
            ocr,
            processing: ProcessingFlag::default(),
        }
    }

    /// Build a pipeline with the collaborators selected in `config`.
    pub fn from_config(store: Store, config: Config) -> Result<Self> {
        let generator = llm::create_generator(&config.generation)?;
        let vision = llm::create_vision(&config)?;
        let ocr = ocr::create_extractor(&config.ocr)?;
        Ok(Self::new(store, config, generator, vision, ocr))
    }

    pub fn processing_flag(&self) -> &ProcessingFlag {
        &self.processing
    }

    /// Process every new or changed file in the dataset.
    pub async fn run_ingestion(&self, dry_run: bool) -> Result<IngestSummary> {
        let _guard = self
            .processing
            .try_acquire()
            .ok_or_else(|| anyhow!("An ingestion run is already in progress"))?;
        self.ingest(dry_run).await
    }

    /// Clear all stored records and checkpoints, then ingest from scratch.
    pub async fn force_reprocess(&self) -> Result<IngestSummary> {
        let _guard = self
            .processing
            .try_acquire()
            .ok_or_else(|| anyhow!("An ingestion run is already in progress"))?;
        info!("Clearing stored records before reprocessing");
        self.store.reset_all().await?;
        self.ingest(false).await
    }

    pub async fn ingestion_status(&self) -> Result<IngestionStatus> {
        let stats = self.store.stats().await?;
        let scan = self.pending_files().await?;
        let sheet_path = self.config.dataset.spreadsheet_path();
        let exists = sheet_path.is_file();
        let sheet_pending = scan.files.iter().any(|f| f.kind == FileKind::Spreadsheet);

        Ok(IngestionStatus {
            stats,
            spreadsheet: SpreadsheetState {
                path: sheet_path.display().to_string(),
                exists,
                processed: exists && !sheet_pending,
            },
            pending: scan.files.iter().map(PendingFile::key).collect(),
            errors: scan.errors,
            processing: self.processing.is_set(),
        })
    }

    async fn ingest(&self, dry_run: bool) -> Result<IngestSummary> {
        let started = Instant::now();
        let PendingScan {
            files: pending,
            errors,
        } = self.pending_files().await?;
        let mut summary = IngestSummary {
            dry_run,
            pending: pending.iter().map(PendingFile::key).collect(),
            errors,
            ..IngestSummary::default()
        };

        if dry_run {
            info!(pending = pending.len(), "Dry run, nothing written");
            if !summary.errors.is_empty() {
                summary.status = RunStatus::PartialSuccess;
            }
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }
        if pending.is_empty() {
            info!("All files are up to date");
        }

        for file in &pending {
            let errors_before = summary.errors.len();
            match &file.kind {
                FileKind::Spreadsheet => self.process_spreadsheet(file, &mut summary).await?,
                FileKind::Document { relative } => {
                    self.process_document(file, relative, &mut summary).await?
                }
            }

            summary.files_processed += 1;
            if summary.errors.len() == errors_before {
                self.store
                    .mark_file_processed(
                        &file.key(),
                        &file.fingerprint.content_hash,
                        file.fingerprint.mtime_ns,
                    )
                    .await?;
            } else {
                warn!(path = %file.key(), "File had failures, leaving it pending");
            }
        }

        if !summary.errors.is_empty() {
            summary.status = RunStatus::PartialSuccess;
        }
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            files = summary.files_processed,
            documents = summary.documents,
            images = summary.images,
            errors = summary.errors.len(),
            "Ingestion finished"
        );
        Ok(summary)
    }

    /// Spreadsheet plus supplementary documents whose checkpoint is stale.
    ///
    /// Files that cannot be walked, read or stat'ed are reported in
    /// [`PendingScan::errors`] and left for the next run.
    async fn pending_files(&self) -> Result<PendingScan> {
        let mut scan = PendingScan::default();
        let mut candidates = Vec::new();
        let sheet = self.config.dataset.spreadsheet_path();
        if sheet.is_file() {
            candidates.push((sheet, FileKind::Spreadsheet));
        } else {
            debug!(path = %sheet.display(), "Primary spreadsheet not found");
        }
        let documents = scan::scan_documents(&self.config.dataset)?;
        scan.errors.extend(documents.errors);
        for file in documents.files {
            candidates.push((
                file.path,
                FileKind::Document {
                    relative: file.relative,
                },
            ));
        }

        for (path, kind) in candidates {
            let (bytes, fingerprint) = match read_candidate(&path).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    scan.errors.push(format!("{}: {:#}", path.display(), e));
                    continue;
                }
            };
            let key = path.display().to_string();
            if self
                .store
                .is_file_processed(&key, &fingerprint.content_hash, fingerprint.mtime_ns)
                .await?
            {
                continue;
            }
            scan.files.push(PendingFile {
                path,
                kind,
                bytes,
                fingerprint,
            });
        }
        Ok(scan)
    }

    async fn process_spreadsheet(&self, file: &PendingFile, summary: &mut IngestSummary) -> Result<()> {
        let source = file.key();
        info!(path = %source, "Processing spreadsheet");

        let table = match spreadsheet::read_table(&file.path, &file.bytes) {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %source, error = %e, "Unreadable spreadsheet");
                summary.errors.push(format!("{}: {}", source, e));
                return Ok(());
            }
        };
        let columns = ColumnMap::from_headers(&table.headers);
        if !columns.has_name() {
            summary
                .errors
                .push(format!("{}: no patient name column", source));
            return Ok(());
        }

        for (index, cells) in table.rows.iter().enumerate() {
            let Some(row) = columns.row(cells) else {
                debug!(row = index, "Skipping row without a patient name");
                summary.skipped_rows += 1;
                continue;
            };
            summary.rows += 1;
            if let Err(e) = self
                .process_row(file, &table.headers, index, &row, summary)
                .await
            {
                warn!(row = index, patient = %row.name, error = %e, "Row failed");
                summary.errors.push(format!("{} row {}: {:#}", source, index, e));
            }
        }
        Ok(())
    }

    async fn process_row(
        &self,
        file: &PendingFile,
        headers: &[String],
        index: usize,
        row: &ClinicalRow,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let source = file.key();
        let patient_id = identity::find_or_create(
            &self.store,
            &self.config.identity,
            &row.name,
            row.patient_id.as_deref(),
        )
        .await?;

        let content = row.note_text();
        let processed_content = self.enhance(&content, "clinical_record").await;

        let mut metadata = row.metadata();
        metadata["file_type"] = json!("clinical_record");
        metadata["source"] = json!(source);
        metadata["row_index"] = json!(index);
        metadata["columns"] = json!(headers);

        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.store
            .upsert_document(&NewDocument {
                patient_id: Some(patient_id),
                source_path: format!("{}#row_{}", source, index),
                file_name,
                file_type: "clinical_record".to_string(),
                content_hash: format!("{}#row_{}", file.fingerprint.content_hash, index),
                content,
                processed_content,
                metadata,
            })
            .await?;
        summary.documents += 1;

        if let Some(raw) = row.image_path.as_deref() {
            self.process_image(patient_id, row, raw, summary).await?;
        }
        Ok(())
    }

    async fn process_image(
        &self,
        patient_id: i64,
        row: &ClinicalRow,
        raw: &str,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let relative = imaging::relative_image_path(raw);
        let path = imaging::resolve_image_path(&self.config.dataset.images_path(), raw);
        if !path.is_file() {
            warn!(patient = %row.name, image = %path.display(), "Image not found");
            summary.images_missing += 1;
            return Ok(());
        }

        let bytes = tokio::fs::read(&path).await?;
        let content_hash = scan::sha256_hex(&bytes);
        if self.store.image_owner(&content_hash).await? == Some(Some(patient_id)) {
            debug!(image = %path.display(), "Image already analysed for this patient");
            summary.images += 1;
            return Ok(());
        }

        let latest_document = self
            .store
            .patient_record(patient_id)
            .await?
            .and_then(|record| record.documents.into_iter().next())
            .map(|doc| doc.content);
        let clinical_context = imaging::clinical_context_from(latest_document.as_deref());
        let category = imaging::image_category(&relative);

        let subject = ImageSubject {
            patient_name: &row.name,
            patient_id: row.patient_id.as_deref().unwrap_or("N/A"),
            category: &category,
            clinical_context: &clinical_context,
        };
        let analysis = imaging::analyze_image(
            self.vision.as_ref(),
            self.ocr.as_ref(),
            &bytes,
            imaging::mime_for(&path),
            &subject,
        )
        .await;
        debug!(
            image = %path.display(),
            method = analysis.processing_method,
            "Image analysed"
        );

        self.store
            .upsert_image(&NewImage {
                patient_id: Some(patient_id),
                source_path: path.display().to_string(),
                file_name: file_name_of(&path),
                content_hash,
                transcription: analysis.combined.clone(),
                category: category.clone(),
                metadata: analysis.metadata(&subject),
            })
            .await?;
        summary.images += 1;
        Ok(())
    }

    async fn process_document(
        &self,
        file: &PendingFile,
        relative: &str,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let source = file.key();
        let text = match extract::extract_document_text(&file.path, &file.bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %source, error = %e, "Extraction failed");
                summary.errors.push(format!("{}: {}", source, e));
                return Ok(());
            }
        };
        if text.is_empty() {
            warn!(path = %source, "No text extracted, skipping");
            return Ok(());
        }

        let (declared_name, declared_id) = extract::patient_from_text(&text);
        let name = declared_name.unwrap_or_else(|| extract::patient_from_path(Path::new(relative)));
        let file_type = extract::file_type_for(&file.path).unwrap_or("txt");

        let patient_id = match identity::find_or_create(
            &self.store,
            &self.config.identity,
            &name,
            declared_id.as_deref(),
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                summary.errors.push(format!("{}: {:#}", source, e));
                return Ok(());
            }
        };

        let processed_content = self.enhance(&text, file_type).await;
        let result = self
            .store
            .upsert_document(&NewDocument {
                patient_id: Some(patient_id),
                source_path: source.clone(),
                file_name: file_name_of(&file.path),
                file_type: file_type.to_string(),
                content_hash: file.fingerprint.content_hash.clone(),
                content: text,
                processed_content,
                metadata: json!({
                    "file_type": file_type,
                    "patient_name": name,
                    "patient_id": declared_id,
                    "source": source,
                    "relative_path": relative,
                }),
            })
            .await;

        match result {
            Ok(_) => {
                info!(path = %source, patient = %name, "Stored document");
                summary.documents += 1;
            }
            Err(e) => summary.errors.push(format!("{}: {:#}", source, e)),
        }
        Ok(())
    }

    /// Enhanced variant of `text`; `None` when the generator is unavailable
    /// or fails.
    async fn enhance(&self, text: &str, file_type: &str) -> Option<String> {
        let turns = [Turn::user(enhance_prompt(text, file_type))];
        match self
            .generator
            .generate(&turns, ENHANCE_TEMPERATURE, ENHANCE_MAX_TOKENS)
            .await
        {
            Ok(generation) if !generation.text.trim().is_empty() => Some(generation.text),
            Ok(_) => None,
            Err(GenerationError::NotConfigured) => None,
            Err(e) => {
                warn!(error = %e, "Enhancement failed, keeping raw text");
                None
            }
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Disabled, Generation};
    use crate::ocr::{DisabledExtractor, TextExtraction};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Echo {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Generator for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, _: &[Turn], _: f32, _: u32) -> Result<Generation, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenerationError::Timeout);
            }
            Ok(Generation {
                text: "Diagnosis\n- enhanced".to_string(),
                model: "echo".to_string(),
                usage: None,
                finish_reason: None,
            })
        }
    }

    struct Radiologist;

    #[async_trait]
    impl VisionAnalyzer for Radiologist {
        async fn analyze_image(&self, _: &[u8], _: &str, prompt: &str) -> Result<String, GenerationError> {
            assert!(prompt.contains("Clinical History: Patient: Alice Moore"));
            Ok("Clear lung fields.".to_string())
        }
    }

    struct Ocr;

    #[async_trait]
    impl TextExtractor for Ocr {
        async fn extract_text(&self, _: &[u8]) -> TextExtraction {
            TextExtraction::Text("PA VIEW".to_string())
        }
    }

    const CSV: &str = "Name,PatientID,Age,Diagnosis,ImagePath\n\
        Alice Moore,M0001,34,Migraine,images/CXR/alice.png\n\
        Bob Stone,M0002,52,Asthma,\n\
        ,M0003,40,Flu,\n";

    async fn setup(csv: &str) -> (TempDir, Config, Store) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.dataset.spreadsheet = PathBuf::from("documents/clinical_data.csv");
        let docs = config.dataset.documents_path();
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(config.dataset.spreadsheet_path(), csv).unwrap();
        let store = Store::open(&config).await.unwrap();
        (tmp, config, store)
    }

    fn disabled_pipeline(store: &Store, config: &Config) -> Pipeline {
        Pipeline::new(
            store.clone(),
            config.clone(),
            Arc::new(Disabled),
            Arc::new(Disabled),
            Arc::new(DisabledExtractor),
        )
    }

    #[tokio::test]
    async fn second_run_processes_nothing() {
        let (_tmp, config, store) = setup(CSV).await;
        let pipeline = disabled_pipeline(&store, &config);

        let first = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(first.files_processed, 1);
        assert_eq!(first.rows, 2);
        assert_eq!(first.documents, 2);
        assert_eq!(first.skipped_rows, 1);
        assert_eq!(first.images_missing, 1);
        assert_eq!(first.status, RunStatus::Success);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_patients, 2);
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.processed_files, 1);

        let second = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(second.files_processed, 0);
        assert_eq!(store.stats().await.unwrap(), stats);
    }

    #[tokio::test]
    async fn changed_spreadsheet_replaces_rows() {
        let (_tmp, config, store) = setup(CSV).await;
        let pipeline = disabled_pipeline(&store, &config);
        pipeline.run_ingestion(false).await.unwrap();

        std::fs::write(
            config.dataset.spreadsheet_path(),
            CSV.replace("Asthma", "COPD"),
        )
        .unwrap();
        let summary = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(summary.files_processed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_documents, 2);
        let bob = store.find_patient_by_normalized_id("m0002").await.unwrap().unwrap();
        let record = store.patient_record(bob.id).await.unwrap().unwrap();
        assert_eq!(record.documents.len(), 1);
        assert!(record.documents[0].content.contains("Diagnosis: COPD"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let (_tmp, config, store) = setup(CSV).await;
        let summary = disabled_pipeline(&store, &config)
            .run_ingestion(true)
            .await
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.pending.len(), 1);
        assert_eq!(store.stats().await.unwrap(), DatabaseStats::default());
    }

    #[tokio::test]
    async fn image_analysis_is_stored() {
        let (_tmp, config, store) = setup(CSV).await;
        let image = config.dataset.images_path().join("CXR/alice.png");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, b"\x89PNG fake").unwrap();

        let pipeline = Pipeline::new(
            store.clone(),
            config.clone(),
            Arc::new(Disabled),
            Arc::new(Radiologist),
            Arc::new(Ocr),
        );
        let summary = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(summary.images, 1);
        assert_eq!(summary.images_missing, 0);

        let alice = store.find_patient_by_normalized_id("m0001").await.unwrap().unwrap();
        let record = store.patient_record(alice.id).await.unwrap().unwrap();
        let stored = &record.images[0];
        assert_eq!(stored.category, "Chest X-Ray");
        assert!(stored.transcription.contains("Clear lung fields."));
        assert!(stored.transcription.ends_with("EXTRACTED TEXT:\nPA VIEW"));
        assert_eq!(stored.metadata["processing_status"], "success");
    }

    #[tokio::test]
    async fn enhancement_is_optional() {
        let (_tmp, config, store) = setup(CSV).await;
        let failing = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let pipeline = Pipeline::new(
            store.clone(),
            config.clone(),
            failing.clone(),
            Arc::new(Disabled),
            Arc::new(DisabledExtractor),
        );
        let summary = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);

        let bob = store.find_patient_by_normalized_id("m0002").await.unwrap().unwrap();
        let record = store.patient_record(bob.id).await.unwrap().unwrap();
        assert!(record.documents[0].processed_content.is_none());

        let working = Arc::new(Echo {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let pipeline = Pipeline::new(
            store.clone(),
            config.clone(),
            working,
            Arc::new(Disabled),
            Arc::new(DisabledExtractor),
        );
        pipeline.force_reprocess().await.unwrap();
        let bob = store.find_patient_by_normalized_id("m0002").await.unwrap().unwrap();
        let record = store.patient_record(bob.id).await.unwrap().unwrap();
        assert_eq!(
            record.documents[0].processed_content.as_deref(),
            Some("Diagnosis\n- enhanced")
        );
    }

    #[tokio::test]
    async fn supplementary_document_joins_existing_patient() {
        let (_tmp, config, store) = setup(CSV).await;
        std::fs::write(
            config.dataset.documents_path().join("discharge.txt"),
            "Patient Name: Alice Moore\nPatient ID: M0001\nDischarged in good condition.",
        )
        .unwrap();

        let summary = disabled_pipeline(&store, &config)
            .run_ingestion(false)
            .await
            .unwrap();
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.documents, 3);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_patients, 2);
        let alice = store.find_patient_by_normalized_id("m0001").await.unwrap().unwrap();
        let record = store.patient_record(alice.id).await.unwrap().unwrap();
        assert_eq!(record.documents.len(), 2);
    }

    #[tokio::test]
    async fn unreadable_document_is_partial_and_stays_pending() {
        let (_tmp, config, store) = setup(CSV).await;
        let bad = config.dataset.documents_path().join("scan.pdf");
        std::fs::write(&bad, b"not a pdf").unwrap();

        let pipeline = disabled_pipeline(&store, &config);
        let summary = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.errors.len(), 1);

        let status = pipeline.ingestion_status().await.unwrap();
        assert!(status.spreadsheet.processed);
        assert_eq!(status.pending, vec![bad.display().to_string()]);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let (_tmp, config, store) = setup(CSV).await;
        let pipeline = disabled_pipeline(&store, &config);
        let _held = pipeline.processing_flag().try_acquire().unwrap();
        let err = pipeline.run_ingestion(false).await.unwrap_err();
        assert!(err.to_string().contains("already in progress"));
    }

    #[tokio::test]
    async fn force_reprocess_clears_chat_history() {
        let (_tmp, config, store) = setup(CSV).await;
        let pipeline = disabled_pipeline(&store, &config);
        pipeline.run_ingestion(false).await.unwrap();
        store
            .add_chat_message("s1", "hi", "hello", None)
            .await
            .unwrap();

        let summary = pipeline.force_reprocess().await.unwrap();
        assert_eq!(summary.files_processed, 1);
        assert!(store.chat_history("s1").await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().total_patients, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unwalkable_entry_does_not_abort_run() {
        let (_tmp, mut config, _) = setup(CSV).await;
        config.dataset.follow_symlinks = true;
        let docs = config.dataset.documents_path();
        std::os::unix::fs::symlink(docs.join("missing.txt"), docs.join("dangling.txt")).unwrap();
        let store = Store::open(&config).await.unwrap();
        let pipeline = disabled_pipeline(&store, &config);

        let summary = pipeline.run_ingestion(false).await.unwrap();
        assert_eq!(summary.status, RunStatus::PartialSuccess);
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("dangling.txt"), "{:?}", summary.errors);
        assert_eq!(store.stats().await.unwrap().total_patients, 2);

        let status = pipeline.ingestion_status().await.unwrap();
        assert!(status.spreadsheet.processed);
        assert_eq!(status.errors.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_candidate_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = read_candidate(&tmp.path().join("nope.txt")).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[tokio::test]
    async fn rows_without_ids_answer_population_questions() {
        let csv = "Name,Age,Diagnosis\nAlice Smith,30,Flu\nBob Jones,45,Asthma\n";
        let (_tmp, config, store) = setup(csv).await;
        let pipeline = disabled_pipeline(&store, &config);
        pipeline.run_ingestion(false).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_patients, 2);
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.total_images, 0);

        let ctx = crate::context::build_context(
            &store,
            &config,
            "How many patients are in the database?",
            crate::context::ConversationState::default(),
        )
        .await
        .unwrap();
        assert_eq!(ctx.scope, crate::context::ContextScope::Aggregate);
        assert!(ctx.text.contains("Total Patients: 2"), "{}", ctx.text);
    }
}
