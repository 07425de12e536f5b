//! Chat session layer on top of the context assembler.
//!
//! [`ChatAssistant::answer`] is the single entry point for a question: it
//! applies a patient switch when the user names somebody new, assembles the
//! context, builds the prompt and calls the generator. A failed generation
//! still yields a `success` response carrying an apology; only storage
//! failures produce `error`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::{self, AssembledContext, ConversationState};
use crate::llm::{self, Generator, Turn, Usage};
use crate::mention;
use crate::models::{ChatMessage, DatabaseStats, Patient};
use crate::prompts::{self, ActivePatient, CHAT_SYSTEM_PROMPT};
use crate::store::Store;

/// Patients listed in the trend-analysis context.
const TREND_PATIENT_LIMIT: usize = 20;
const SUMMARY_MAX_TOKENS: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub status: ResponseStatus,
    pub response: String,
    /// Display name of the patient the answer is about.
    pub patient_context: Option<String>,
    pub has_context: bool,
    pub auto_context_set: bool,
    /// State to pass with the next question.
    pub state: ConversationState,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatientSummaryReport {
    pub patient: Patient,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub stats: DatabaseStats,
    pub analysis: String,
}

pub struct ChatAssistant {
    store: Store,
    config: Config,
    generator: Arc<dyn Generator>,
}

impl ChatAssistant {
    pub fn new(store: Store, config: Config, generator: Arc<dyn Generator>) -> Self {
        Self {
            store,
            config,
            generator,
        }
    }

    pub fn from_config(store: Store, config: Config) -> Result<Self> {
        let generator = llm::create_generator(&config.generation)?;
        Ok(Self::new(store, config, generator))
    }

    /// Answer `query`. The returned [`ChatResponse::state`] carries the
    /// conversation forward.
    pub async fn answer(
        &self,
        query: &str,
        state: ConversationState,
        session_id: Option<&str>,
        debug: bool,
    ) -> ChatResponse {
        match self.try_answer(query, state, session_id, debug).await {
            Ok(response) => response,
            Err(e) => {
                let message = format!("Error generating response: {:#}", e);
                warn!(error = %message, "Chat query failed");
                if let Some(session) = session_id {
                    if let Err(e) = self
                        .store
                        .add_chat_message(session, query, &message, None)
                        .await
                    {
                        warn!(error = %e, "Could not record failed query");
                    }
                }
                ChatResponse {
                    status: ResponseStatus::Error,
                    response: message.clone(),
                    patient_context: None,
                    has_context: false,
                    auto_context_set: false,
                    state,
                    sources: Vec::new(),
                    model: None,
                    usage: None,
                    debug: debug.then(|| json!({ "error": message })),
                }
            }
        }
    }

    async fn try_answer(
        &self,
        query: &str,
        mut state: ConversationState,
        session_id: Option<&str>,
        debug: bool,
    ) -> Result<ChatResponse> {
        let mut switched = false;
        if state.active_patient.is_some() {
            if let Some(p) =
                context::mentioned_switch(&self.store, &self.config.identity, query, state).await?
            {
                debug!(patient = %p.display_name, "Switching active patient");
                state = ConversationState::with_patient(p.id);
                switched = true;
            }
        }

        let ctx = context::build_context(&self.store, &self.config, query, state).await?;
        let active = match ctx.state.active_patient {
            Some(id) => self.store.get_patient(id).await?,
            None => None,
        };

        let user_prompt = prompts::chat_user_prompt(
            &ctx.text,
            query,
            active.as_ref().map(|p| ActivePatient {
                name: &p.display_name,
                external_id: p.external_id.as_deref(),
            }),
        );
        let turns = [Turn::system(CHAT_SYSTEM_PROMPT), Turn::user(user_prompt)];
        let generation_cfg = &self.config.generation;

        let (response, model, usage, error) = match self
            .generator
            .generate(&turns, generation_cfg.temperature, generation_cfg.max_tokens)
            .await
        {
            Ok(g) => (g.text, Some(g.model), g.usage, None),
            Err(e) => {
                warn!(error = %e, "Generation failed");
                (
                    format!(
                        "I apologize, but I encountered an error processing your request: {}",
                        e
                    ),
                    None,
                    None,
                    Some(e.to_string()),
                )
            }
        };

        let patient_context = active.as_ref().map(|p| p.display_name.clone());
        if let Some(session) = session_id {
            self.store
                .add_chat_message(session, query, &response, patient_context.as_deref())
                .await?;
        }

        let debug_info = debug.then(|| {
            debug_info(
                &ctx,
                query,
                &turns,
                self.generator.model_name(),
                &self.config,
                error.as_deref(),
                usage.as_ref(),
            )
        });

        Ok(ChatResponse {
            status: ResponseStatus::Success,
            response,
            patient_context,
            has_context: !ctx.text.trim().is_empty(),
            auto_context_set: ctx.auto_context_set || switched,
            state: ctx.state,
            sources: ctx.sources,
            model,
            usage,
            debug: debug_info,
        })
    }

    /// Generated summary for a patient named or identified by `name_or_id`.
    /// `None` when no such patient exists.
    pub async fn patient_summary(&self, name_or_id: &str) -> Result<Option<PatientSummaryReport>> {
        let Some(patient) =
            context::set_patient_context(&self.store, &self.config.identity, name_or_id).await?
        else {
            return Ok(None);
        };
        let Some(record) = self.store.patient_record(patient.id).await? else {
            return Ok(None);
        };

        let context = context::format_patient_context(&record, &self.config.context);
        let cfg = &self.config.generation;
        let generation = self
            .generator
            .generate(
                &[Turn::user(prompts::summary_prompt(&context))],
                cfg.temperature * 0.67,
                cfg.max_tokens.min(SUMMARY_MAX_TOKENS),
            )
            .await
            .map_err(|e| anyhow!("Error generating summary: {}", e))?;

        Ok(Some(PatientSummaryReport {
            patient,
            summary: generation.text,
        }))
    }

    /// Database-wide analysis, optionally focused by `request`.
    pub async fn analyze_trends(&self, request: Option<&str>) -> Result<TrendReport> {
        let stats = self.store.stats().await?;
        let patients = self.store.list_patients().await?;

        let mut context = format!(
            "DATABASE STATISTICS:\n- Total Patients: {}\n- Total Documents: {}\n- Total Images: {}\n\nPATIENT LIST:\n",
            stats.total_patients, stats.total_documents, stats.total_images
        );
        for p in patients.iter().take(TREND_PATIENT_LIMIT) {
            context.push_str(&format!(
                "- {} (ID: {}) - {} docs, {} images\n",
                p.display_name,
                p.external_id.as_deref().unwrap_or("N/A"),
                p.document_count,
                p.image_count
            ));
        }
        if patients.len() > TREND_PATIENT_LIMIT {
            context.push_str(&format!(
                "... and {} more patients\n",
                patients.len() - TREND_PATIENT_LIMIT
            ));
        }

        let cfg = &self.config.generation;
        let generation = self
            .generator
            .generate(
                &[Turn::user(prompts::trends_prompt(&context, request))],
                cfg.temperature,
                cfg.max_tokens,
            )
            .await
            .map_err(|e| anyhow!("Error analyzing trends: {}", e))?;

        Ok(TrendReport {
            stats,
            analysis: generation.text,
        })
    }

    /// Starter questions, specific to `patient` when it resolves.
    pub async fn suggested_questions(&self, patient: Option<&str>) -> Result<Vec<String>> {
        if let Some(name_or_id) = patient {
            if let Some(p) =
                context::set_patient_context(&self.store, &self.config.identity, name_or_id)
                    .await?
            {
                let name = &p.display_name;
                let mut questions = vec![
                    format!("What is the diagnosis for {}?", name),
                    format!("What treatments has {} received?", name),
                    format!("What are the recent test results for {}?", name),
                    format!("What medications is {} taking?", name),
                    format!("What is the medical history of {}?", name),
                ];
                let has_images = self
                    .store
                    .patient_record(p.id)
                    .await?
                    .is_some_and(|r| !r.images.is_empty());
                if has_images {
                    questions.push(format!("What do the medical images show for {}?", name));
                }
                return Ok(questions);
            }
        }

        Ok([
            "How many patients are in the database?",
            "What are the most common diagnoses?",
            "Show me patients with cardiovascular conditions",
            "What imaging studies have been performed?",
            "Which patients need follow-up care?",
            "What are the recent test results across all patients?",
        ]
        .iter()
        .map(|q| q.to_string())
        .collect())
    }

    pub async fn chat_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.store.chat_history(session_id).await
    }

    /// Resolve an explicit `/patient` selection into a new state.
    pub async fn select_patient(&self, name_or_id: &str) -> Result<Option<(Patient, ConversationState)>> {
        Ok(
            context::set_patient_context(&self.store, &self.config.identity, name_or_id)
                .await?
                .map(|p| {
                    let state = ConversationState::with_patient(p.id);
                    (p, state)
                }),
        )
    }
}

fn debug_info(
    ctx: &AssembledContext,
    query: &str,
    turns: &[Turn],
    model: &str,
    config: &Config,
    error: Option<&str>,
    usage: Option<&Usage>,
) -> serde_json::Value {
    json!({
        "api_request": {
            "provider": config.generation.provider,
            "model": model,
            "messages": turns,
            "temperature": config.generation.temperature,
            "max_tokens": config.generation.max_tokens,
        },
        "context_info": {
            "scope": ctx.scope,
            "has_patient_context": ctx.state.active_patient.is_some(),
            "patient_name": ctx.patient_name(),
            "mentioned_patient": mention::extract_mention(query).map(|m| m.as_str().to_string()),
            "context_length_chars": ctx.text.chars().count(),
            "system_prompt_length": turns.first().map(|t| t.content.chars().count()),
            "user_prompt_length": turns.get(1).map(|t| t.content.chars().count()),
            "context_sources": ctx.sources,
        },
        "api_response": usage,
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::llm::{Disabled, Generation, GenerationError};
    use crate::models::{NewDocument, NewImage};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every request and answers with a fixed text.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<(Vec<Turn>, f32, u32)>>,
    }

    #[async_trait::async_trait]
    impl Generator for Recorder {
        fn model_name(&self) -> &str {
            "recorder"
        }

        async fn generate(
            &self,
            turns: &[Turn],
            temperature: f32,
            max_tokens: u32,
        ) -> Result<Generation, GenerationError> {
            self.requests
                .lock()
                .unwrap()
                .push((turns.to_vec(), temperature, max_tokens));
            Ok(Generation {
                text: "answer".to_string(),
                model: "recorder-1".to_string(),
                usage: None,
                finish_reason: Some("stop".to_string()),
            })
        }
    }

    impl Recorder {
        fn last_user_prompt(&self) -> String {
            let requests = self.requests.lock().unwrap();
            let (turns, _, _) = requests.last().unwrap();
            turns.last().unwrap().content.clone()
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
            metadata: json!({ "source": "sheet.csv" }),
        }
    }

    async fn seeded(generator: Arc<dyn Generator>) -> (TempDir, ChatAssistant, Store) {
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
        store
            .upsert_image(&NewImage {
                patient_id: Some(jane),
                source_path: "images/MRI/jane.png".to_string(),
                file_name: "jane.png".to_string(),
                content_hash: "img-jane".to_string(),
                transcription: "No acute findings".to_string(),
                category: "MRI".to_string(),
                metadata: json!({}),
            })
            .await
            .unwrap();
        let assistant = ChatAssistant::new(store.clone(), config, generator);
        (tmp, assistant, store)
    }

    #[tokio::test]
    async fn follow_up_keeps_the_mentioned_patient() {
        let recorder = Arc::new(Recorder::default());
        let (_tmp, assistant, _store) = seeded(recorder.clone()).await;

        let first = assistant
            .answer("What did Jane Doe have?", ConversationState::default(), None, false)
            .await;
        assert_eq!(first.status, ResponseStatus::Success);
        assert!(first.auto_context_set);
        assert_eq!(first.patient_context.as_deref(), Some("Jane Doe"));
        assert!(recorder
            .last_user_prompt()
            .starts_with("CURRENT PATIENT CONTEXT: Jane Doe (ID: M0007)"));

        let second = assistant.answer("what else?", first.state, None, false).await;
        assert_eq!(second.patient_context.as_deref(), Some("Jane Doe"));
        assert!(!second.auto_context_set);
        assert!(recorder.last_user_prompt().contains("Diagnosis: Migraine"));
    }

    #[tokio::test]
    async fn naming_another_patient_switches() {
        let recorder = Arc::new(Recorder::default());
        let (_tmp, assistant, _store) = seeded(recorder.clone()).await;

        let first = assistant
            .answer("What did Jane Doe have?", ConversationState::default(), None, false)
            .await;
        let second = assistant
            .answer("what about Bob Stone's diagnosis", first.state, None, false)
            .await;
        assert_eq!(second.patient_context.as_deref(), Some("Bob Stone"));
        assert!(second.auto_context_set);
        assert_ne!(second.state, first.state);
        assert!(recorder.last_user_prompt().contains("Diagnosis: Asthma"));
    }

    #[tokio::test]
    async fn generation_failure_is_an_apology_and_recorded() {
        let (_tmp, assistant, store) = seeded(Arc::new(Disabled)).await;

        let out = assistant
            .answer("How many patients are there?", ConversationState::default(), Some("s1"), true)
            .await;
        assert_eq!(out.status, ResponseStatus::Success);
        assert!(out.response.starts_with("I apologize"));
        assert!(out.patient_context.is_none());
        assert!(out.has_context);
        let debug = out.debug.unwrap();
        assert_eq!(debug["context_info"]["scope"]["kind"], "aggregate");
        assert!(debug["error"].is_string());

        let history = store.chat_history("s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "How many patients are there?");
    }

    #[tokio::test]
    async fn summary_uses_lower_temperature_and_capped_tokens() {
        let recorder = Arc::new(Recorder::default());
        let (_tmp, assistant, _store) = seeded(recorder.clone()).await;

        let report = assistant.patient_summary("M0007").await.unwrap().unwrap();
        assert_eq!(report.patient.display_name, "Jane Doe");
        assert_eq!(report.summary, "answer");

        let requests = recorder.requests.lock().unwrap();
        let (turns, temperature, max_tokens) = &requests[0];
        assert!((*temperature - 0.3 * 0.67).abs() < 1e-6);
        assert_eq!(*max_tokens, 1500);
        assert!(turns[0].content.contains("PATIENT INFORMATION:"));
        drop(requests);

        assert!(assistant.patient_summary("Zed Quinn").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trends_list_patients() {
        let recorder = Arc::new(Recorder::default());
        let (_tmp, assistant, _store) = seeded(recorder.clone()).await;

        let report = assistant.analyze_trends(Some("diagnoses")).await.unwrap();
        assert_eq!(report.stats.total_patients, 2);
        let prompt = recorder.last_user_prompt();
        assert!(prompt.contains("- Total Patients: 2"));
        assert!(prompt.contains("- Jane Doe (ID: M0007) - 1 docs, 1 images"));
        assert!(prompt.contains("Specific Analysis Request: diagnoses"));
    }

    #[tokio::test]
    async fn suggestions_depend_on_patient() {
        let (_tmp, assistant, _store) = seeded(Arc::new(Disabled)).await;

        let general = assistant.suggested_questions(None).await.unwrap();
        assert_eq!(general.len(), 6);

        let jane = assistant.suggested_questions(Some("Jane Doe")).await.unwrap();
        assert_eq!(jane.len(), 6);
        assert!(jane[5].contains("medical images"));

        let bob = assistant.suggested_questions(Some("Bob Stone")).await.unwrap();
        assert_eq!(bob.len(), 5);
    }

    #[tokio::test]
    async fn explicit_selection_sets_state() {
        let (_tmp, assistant, _store) = seeded(Arc::new(Disabled)).await;
        let (patient, state) = assistant.select_patient("bob stone").await.unwrap().unwrap();
        assert_eq!(patient.display_name, "Bob Stone");
        assert_eq!(state.active_patient, Some(patient.id));
        assert!(assistant.select_patient("nobody here").await.unwrap().is_none());
    }
}
