//! Roster commands: `patients`, `search` and `context`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::context::{self, ContextScope, ConversationState};
use crate::identity;
use crate::models::format_ts_date;
use crate::store::Store;

/// List every patient with record counts, newest first.
pub async fn run_patients(store: &Store) -> Result<()> {
    let patients = store.list_patients().await?;
    if patients.is_empty() {
        println!("No patients.");
        return Ok(());
    }

    println!(
        "{:<6} {:<28} {:<12} {:>5} {:>6}  {}",
        "ID", "NAME", "PATIENT ID", "DOCS", "IMAGES", "CREATED"
    );
    for p in &patients {
        println!(
            "{:<6} {:<28} {:<12} {:>5} {:>6}  {}",
            p.id,
            p.display_name,
            p.external_id.as_deref().unwrap_or("-"),
            p.document_count,
            p.image_count,
            format_ts_date(p.created_at)
        );
    }
    println!();
    println!("{} patients", patients.len());
    Ok(())
}

/// Substring search over names, ids and record text.
pub async fn run_search(store: &Store, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let hits = identity::search_by_name_or_id(store, query).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. {} (ID: {})  [patient {}]",
            i + 1,
            hit.display_name,
            hit.external_id.as_deref().unwrap_or("N/A"),
            hit.id
        );
    }
    Ok(())
}

/// Print the context that would be sent for `query`, optionally with a
/// patient already selected.
pub async fn run_context(
    config: &Config,
    store: &Store,
    query: &str,
    patient: Option<&str>,
) -> Result<()> {
    let mut state = ConversationState::default();
    if let Some(name_or_id) = patient {
        match context::set_patient_context(store, &config.identity, name_or_id).await? {
            Some(p) => state = ConversationState::with_patient(p.id),
            None => bail!("Patient not found: {}", name_or_id),
        }
    }

    let ctx = context::build_context(store, config, query, state).await?;
    let scope = match &ctx.scope {
        ContextScope::Patient { name, .. } => format!("patient ({})", name),
        ContextScope::Roster { count } => format!("roster ({} patients)", count),
        ContextScope::Aggregate => "aggregate".to_string(),
    };
    println!("scope: {}", scope);
    if ctx.auto_context_set {
        println!("active patient set from query");
    }
    if !ctx.sources.is_empty() {
        println!("sources:");
        for s in &ctx.sources {
            println!("  {}", s);
        }
    }
    println!();
    println!("{}", ctx.text);
    Ok(())
}
