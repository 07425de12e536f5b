//! Context assembly.
//!
//! Turns a free-text query into a bounded block of text for the generator.
//! The decision order is:
//!
//! 1. an active patient from [`ConversationState`] is always used as-is;
//! 2. statistical questions get the aggregate context;
//! 3. a mentioned patient (id or name) is resolved, serialized, and becomes
//!    the active patient for the following turns;
//! 4. otherwise a roster search over names, ids and record text supplies up
//!    to `max_roster_patients` patients;
//! 5. with nothing found, the aggregate context is the fallback.
//!
//! The conversation state is a small `Copy` value owned by the caller and
//! threaded through every call; the assembler itself holds no state.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{Config, ContextConfig, IdentityConfig};
use crate::identity;
use crate::mention::{self, Mention};
use crate::models::{format_ts_iso, Patient, PatientRecord};
use crate::store::Store;

/// Which patient, if any, the conversation is currently about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversationState {
    pub active_patient: Option<i64>,
}

impl ConversationState {
    pub fn with_patient(id: i64) -> Self {
        Self {
            active_patient: Some(id),
        }
    }

    pub fn cleared() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextScope {
    Patient { id: i64, name: String },
    Roster { count: usize },
    Aggregate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub scope: ContextScope,
    pub state: ConversationState,
    /// The active patient was set by a mention in this query.
    pub auto_context_set: bool,
    /// Source paths of the documents and images behind `text`.
    pub sources: Vec<String>,
}

impl AssembledContext {
    pub fn patient_name(&self) -> Option<&str> {
        match &self.scope {
            ContextScope::Patient { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Assemble the context for `query` given the current conversation state.
pub async fn build_context(
    store: &Store,
    config: &Config,
    query: &str,
    state: ConversationState,
) -> Result<AssembledContext> {
    let limits = &config.context;

    if let Some(id) = state.active_patient {
        match store.patient_record(id).await? {
            Some(record) => return Ok(patient_context(&record, limits, state, false)),
            None => {
                warn!(patient_id = id, "Active patient no longer exists; clearing");
            }
        }
    }
    let state = ConversationState::cleared();

    if mention::is_aggregate_query(query) {
        debug!("Aggregate query");
        return aggregate_context(store, limits, state).await;
    }

    match targeted_context(store, config, query).await {
        Ok(Some(ctx)) => Ok(ctx),
        Ok(None) => aggregate_context(store, limits, state).await,
        Err(e) => {
            warn!(error = %e, "Patient lookup failed; using aggregate context");
            aggregate_context(store, limits, state).await
        }
    }
}

/// Mention resolution, then roster search.
async fn targeted_context(
    store: &Store,
    config: &Config,
    query: &str,
) -> Result<Option<AssembledContext>> {
    let limits = &config.context;

    if let Some(m) = mention::extract_mention(query) {
        debug!(mention = ?m, "Mention extracted");
        if let Some(patient) =
            identity::resolve_mention(store, &config.identity, m.as_str(), query).await?
        {
            if let Some(record) = store.patient_record(patient.id).await? {
                let state = ConversationState::with_patient(patient.id);
                return Ok(Some(patient_context(&record, limits, state, true)));
            }
        }
    }

    let hits = identity::search_by_name_or_id(store, query).await?;
    if hits.is_empty() {
        return Ok(None);
    }

    let mut text = String::from("RELEVANT PATIENTS AND INFORMATION:\n");
    let mut sources = Vec::new();
    let mut count = 0;
    for hit in hits.iter().take(limits.max_roster_patients) {
        let Some(record) = store.patient_record(hit.id).await? else {
            continue;
        };
        text.push_str(&format!("--- PATIENT: {} ---\n", hit.display_name));
        text.push_str(&format_patient_context(&record, limits));
        text.push_str(&format!("\n{}\n\n", "=".repeat(50)));
        extend_sources(&mut sources, &record);
        count += 1;
    }

    Ok(Some(AssembledContext {
        text,
        scope: ContextScope::Roster { count },
        state: ConversationState::cleared(),
        auto_context_set: false,
        sources,
    }))
}

fn patient_context(
    record: &PatientRecord,
    limits: &ContextConfig,
    state: ConversationState,
    auto_context_set: bool,
) -> AssembledContext {
    let mut sources = Vec::new();
    extend_sources(&mut sources, record);
    AssembledContext {
        text: format_patient_context(record, limits),
        scope: ContextScope::Patient {
            id: record.patient.id,
            name: record.patient.display_name.clone(),
        },
        state,
        auto_context_set,
        sources,
    }
}

async fn aggregate_context(
    store: &Store,
    limits: &ContextConfig,
    state: ConversationState,
) -> Result<AssembledContext> {
    Ok(AssembledContext {
        text: format_aggregate_context(store, limits).await?,
        scope: ContextScope::Aggregate,
        state,
        auto_context_set: false,
        sources: Vec::new(),
    })
}

fn extend_sources(sources: &mut Vec<String>, record: &PatientRecord) {
    let doc_sources = record.documents.iter().map(|d| {
        d.metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or(&d.source_path)
            .to_string()
    });
    let image_sources = record.images.iter().map(|i| i.source_path.clone());

    for source in doc_sources.chain(image_sources) {
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
}

/// Cut `text` to `max` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Serialize one patient: header, recent documents, recent images.
pub fn format_patient_context(record: &PatientRecord, limits: &ContextConfig) -> String {
    let patient = &record.patient;
    let name = &patient.display_name;
    let external_id = patient.external_id.as_deref().unwrap_or("N/A");

    let mut out = String::new();
    out.push_str("PATIENT INFORMATION:\n");
    out.push_str(&format!("Name: {}\n", name));
    out.push_str(&format!("Patient ID: {}\n", external_id));
    out.push_str(&format!("Records Created: {}\n\n", format_ts_iso(patient.created_at)));

    out.push_str(&format!(
        "MEDICAL DOCUMENTS ({} total):\n",
        record.documents.len()
    ));
    for (i, doc) in record.documents.iter().take(limits.max_documents).enumerate() {
        out.push_str(&format!("\nDocument {} ({}):\n", i + 1, doc.file_name));
        out.push_str(&truncate_chars(doc.best_text(), limits.document_chars));
        out.push('\n');
    }
    if record.documents.len() > limits.max_documents {
        out.push_str(&format!(
            "\n... and {} more documents\n",
            record.documents.len() - limits.max_documents
        ));
    }

    if record.images.is_empty() {
        out.push_str(&format!("\nNo medical imaging results found for {}.\n", name));
        return out;
    }

    out.push_str(&format!(
        "\nMEDICAL IMAGING RESULTS FOR {} ({} total):\n",
        name,
        record.images.len()
    ));
    out.push_str(&"=".repeat(50));
    out.push('\n');
    for (i, image) in record.images.iter().take(limits.max_images).enumerate() {
        out.push_str(&format!(
            "\nIMAGE {}: {} - {}\n",
            i + 1,
            image.category,
            image.file_name
        ));
        out.push_str(&format!("Patient: {} (ID: {})\n", name, external_id));
        out.push_str(&"-".repeat(30));
        out.push('\n');
        out.push_str(&truncate_chars(&image.transcription, limits.image_chars));
        out.push('\n');
        out.push_str(&"-".repeat(30));
        out.push('\n');
    }
    if record.images.len() > limits.max_images {
        out.push_str(&format!(
            "\n... and {} more images for {}\n",
            record.images.len() - limits.max_images,
            name
        ));
    }

    out
}

/// Store-wide statistics followed by a bounded dump of every patient's notes.
pub async fn format_aggregate_context(store: &Store, limits: &ContextConfig) -> Result<String> {
    let stats = store.stats().await?;
    let (entries, total_entries) = store.aggregate_entries(limits.aggregate_entries).await?;

    let mut out = String::new();
    out.push_str("DATABASE STATISTICS:\n");
    out.push_str(&format!("- Total Patients: {}\n", stats.total_patients));
    out.push_str(&format!("- Total Documents: {}\n", stats.total_documents));
    out.push_str(&format!("- Total Images: {}\n", stats.total_images));
    out.push_str(&format!("- Processed Files: {}\n", stats.processed_files));
    out.push_str("\nCOMPREHENSIVE PATIENT DATA FOR ANALYSIS:\n");

    for entry in &entries {
        out.push_str(&format!(
            "\nPatient: {} (ID: {})\nMedical Data: {}\n",
            entry.display_name,
            entry.external_id.as_deref().unwrap_or("N/A"),
            truncate_chars(&entry.text, limits.aggregate_chars)
        ));
    }

    let omitted = total_entries - entries.len() as i64;
    if omitted > 0 {
        out.push_str(&format!(
            "\n... and {} more clinical records omitted\n",
            omitted
        ));
    }

    if stats.total_patients > 0 {
        let patients = stats.total_patients as f64;
        out.push_str("\nDATABASE ANALYTICS:\n");
        out.push_str(&format!(
            "- Average Documents per Patient: {:.1}\n",
            stats.total_documents as f64 / patients
        ));
        out.push_str(&format!(
            "- Average Images per Patient: {:.1}\n",
            stats.total_images as f64 / patients
        ));
        out.push_str(&format!(
            "- Total Clinical Records Available: {}\n",
            total_entries
        ));
    }

    Ok(out)
}

/// Look up the patient a user explicitly selected: by id, exact name, then
/// fuzzy mention resolution.
pub async fn set_patient_context(
    store: &Store,
    identity_cfg: &IdentityConfig,
    name_or_id: &str,
) -> Result<Option<Patient>> {
    let key = identity::normalize(name_or_id);
    if key.is_empty() {
        return Ok(None);
    }

    if let Some(p) = store.find_patient_by_normalized_id(&key).await? {
        return Ok(Some(p));
    }
    if let Some(p) = store.find_patient_by_normalized_name(&key).await? {
        return Ok(Some(p));
    }
    identity::resolve_mention(store, identity_cfg, name_or_id, name_or_id).await
}

/// The patient named in `query` when it differs from the active one.
///
/// Lets the session layer switch patients when the user names somebody new
/// mid-conversation, while content-free follow-ups keep the active patient.
pub async fn mentioned_switch(
    store: &Store,
    identity_cfg: &IdentityConfig,
    query: &str,
    state: ConversationState,
) -> Result<Option<Patient>> {
    let Some(m) = mention::extract_mention(query) else {
        return Ok(None);
    };
    let resolved = match &m {
        Mention::ById(id) => {
            store
                .find_patient_by_normalized_id(&identity::normalize(id))
                .await?
        }
        Mention::ByName(name) => {
            identity::resolve_mention(store, identity_cfg, name, query).await?
        }
    };
    Ok(resolved.filter(|p| Some(p.id) != state.active_patient))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, Image, NewDocument};
    use tempfile::TempDir;

    fn patient(name: &str) -> Patient {
        Patient {
            id: 1,
            display_name: name.to_string(),
            external_id: Some("M0001".to_string()),
            normalized_name: identity::normalize(name),
            normalized_id: "m0001".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn document(i: i64, content: &str) -> Document {
        Document {
            id: i,
            patient_id: Some(1),
            source_path: format!("sheet.csv#row_{}", i),
            file_name: "sheet.csv".to_string(),
            file_type: "clinical_record".to_string(),
            content_hash: format!("h{}", i),
            content: content.to_string(),
            processed_content: None,
            metadata: serde_json::json!({ "source": "sheet.csv" }),
            created_at: 100 - i,
        }
    }

    fn image(i: i64) -> Image {
        Image {
            id: i,
            patient_id: Some(1),
            source_path: format!("images/scan{}.png", i),
            file_name: format!("scan{}.png", i),
            content_hash: format!("i{}", i),
            transcription: format!("finding {}", i),
            category: "MRI".to_string(),
            metadata: serde_json::json!({}),
            created_at: 100 - i,
        }
    }

    fn note(patient_id: i64, row: usize, text: &str) -> NewDocument {
        NewDocument {
            patient_id: Some(patient_id),
            source_path: format!("sheet.csv#row_{}", row),
            file_name: "sheet.csv".to_string(),
            file_type: "clinical_record".to_string(),
            content_hash: format!("hash#row_{}", row),
            content: text.to_string(),
            processed_content: None,
            metadata: serde_json::json!({ "source": "sheet.csv" }),
        }
    }

    async fn seeded() -> (TempDir, Store, Config, i64, i64) {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let store = Store::open(&config).await.unwrap();
        let jane = identity::find_or_create(&store, &config.identity, "Jane Doe", Some("M0007"))
            .await
            .unwrap();
        let bob = identity::find_or_create(&store, &config.identity, "Bob Stone", None)
            .await
            .unwrap();
        store
            .upsert_document(&note(jane, 0, "Diagnosis: Migraine"))
            .await
            .unwrap();
        store
            .upsert_document(&note(bob, 1, "Diagnosis: Asthma"))
            .await
            .unwrap();
        (tmp, store, config, jane, bob)
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }

    #[test]
    fn fifteen_documents_show_ten_and_a_remainder_note() {
        let record = PatientRecord {
            patient: patient("Jane Doe"),
            documents: (0..15).map(|i| document(i, &format!("note {}", i))).collect(),
            images: Vec::new(),
        };
        let text = format_patient_context(&record, &ContextConfig::default());

        assert!(text.contains("MEDICAL DOCUMENTS (15 total)"));
        assert!(text.contains("Document 10 (sheet.csv)"));
        assert!(!text.contains("Document 11 "));
        assert!(text.contains("... and 5 more documents"));
        assert!(text.contains("No medical imaging results found for Jane Doe."));
    }

    #[tokio::test]
    async fn possessive_name_without_lead_in_selects_patient() {
        let (_tmp, store, config, _, _) = seeded().await;
        let john = identity::find_or_create(&store, &config.identity, "John Smith", None)
            .await
            .unwrap();
        store
            .upsert_document(&note(john, 2, "Diagnosis: Hypertension"))
            .await
            .unwrap();

        let ctx = build_context(
            &store,
            &config,
            "What is John Smith's diagnosis?",
            ConversationState::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            ctx.scope,
            ContextScope::Patient {
                id: john,
                name: "John Smith".to_string()
            }
        );
        assert!(ctx.auto_context_set);
        assert_eq!(ctx.state.active_patient, Some(john));
        assert!(ctx.text.contains("Hypertension"));
        assert!(!ctx.text.contains("Migraine"));
    }

    #[test]
    fn long_documents_are_truncated_and_images_capped() {
        let record = PatientRecord {
            patient: patient("Jane Doe"),
            documents: vec![document(0, &"x".repeat(1500))],
            images: (0..7).map(image).collect(),
        };
        let text = format_patient_context(&record, &ContextConfig::default());

        assert!(text.contains(&format!("{}...", "x".repeat(1000))));
        assert!(!text.contains(&"x".repeat(1001)));
        assert!(text.contains("IMAGE 5: MRI - scan4.png"));
        assert!(!text.contains("IMAGE 6:"));
        assert!(text.contains("... and 2 more images for Jane Doe"));
    }

    #[tokio::test]
    async fn aggregate_query_gets_statistics() {
        let (_tmp, store, config, _, _) = seeded().await;
        let ctx = build_context(&store, &config, "How many patients are there?", ConversationState::default())
            .await
            .unwrap();

        assert_eq!(ctx.scope, ContextScope::Aggregate);
        assert!(ctx.text.contains("- Total Patients: 2"));
        assert!(ctx.text.contains("Average Documents per Patient: 1.0"));
        assert_eq!(ctx.state.active_patient, None);
    }

    #[tokio::test]
    async fn mention_sets_patient_and_follow_up_keeps_it() {
        let (_tmp, store, config, jane, _) = seeded().await;

        let first = build_context(&store, &config, "What did Jane Doe have?", ConversationState::default())
            .await
            .unwrap();
        assert!(first.auto_context_set);
        assert_eq!(first.state.active_patient, Some(jane));
        assert!(first.text.contains("Migraine"));
        assert_eq!(first.sources, vec!["sheet.csv".to_string()]);

        let follow_up = build_context(&store, &config, "what else?", first.state)
            .await
            .unwrap();
        assert!(!follow_up.auto_context_set);
        assert_eq!(follow_up.state.active_patient, Some(jane));
        assert_eq!(follow_up.patient_name(), Some("Jane Doe"));
        assert!(follow_up.text.contains("Migraine"));
    }

    #[tokio::test]
    async fn content_search_returns_roster_without_changing_state() {
        let (_tmp, store, config, _, _) = seeded().await;
        let ctx = build_context(&store, &config, "Asthma", ConversationState::default())
            .await
            .unwrap();

        assert_eq!(ctx.scope, ContextScope::Roster { count: 1 });
        assert!(ctx.text.contains("--- PATIENT: Bob Stone ---"));
        assert_eq!(ctx.state.active_patient, None);
    }

    #[tokio::test]
    async fn unmatched_query_falls_back_to_aggregate() {
        let (_tmp, store, config, _, _) = seeded().await;
        let ctx = build_context(&store, &config, "xylophone", ConversationState::default())
            .await
            .unwrap();
        assert_eq!(ctx.scope, ContextScope::Aggregate);
    }

    #[tokio::test]
    async fn dangling_state_is_cleared() {
        let (_tmp, store, config, _, _) = seeded().await;
        let ctx = build_context(&store, &config, "xylophone", ConversationState::with_patient(9999))
            .await
            .unwrap();
        assert_eq!(ctx.state, ConversationState::cleared());
        assert_eq!(ctx.scope, ContextScope::Aggregate);
    }

    #[tokio::test]
    async fn explicit_selection_and_switching() {
        let (_tmp, store, config, jane, bob) = seeded().await;

        let by_id = set_patient_context(&store, &config.identity, "m0007").await.unwrap();
        assert_eq!(by_id.map(|p| p.id), Some(jane));
        let by_name = set_patient_context(&store, &config.identity, "bob stone").await.unwrap();
        assert_eq!(by_name.map(|p| p.id), Some(bob));
        assert!(set_patient_context(&store, &config.identity, "").await.unwrap().is_none());

        let state = ConversationState::with_patient(jane);
        let switch = mentioned_switch(&store, &config.identity, "what about Bob Stone's diagnosis", state)
            .await
            .unwrap();
        assert_eq!(switch.map(|p| p.id), Some(bob));
        let same = mentioned_switch(&store, &config.identity, "tell me about Jane Doe", state)
            .await
            .unwrap();
        assert!(same.is_none());
    }
}
