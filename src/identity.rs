//! Patient identity resolution.
//!
//! Names and ids arrive in many spellings: `"John Smith"`, `"john-smith"`,
//! `"JOHN_SMITH"`. All comparisons run on [`normalize`]d forms, and near-miss
//! spellings are merged with the [`ratio`] similarity score so that one real
//! person maps to one patient row.
//!
//! | Function | Used by |
//! |----------|---------|
//! | [`find_or_create`] | ingestion, once per spreadsheet row or document |
//! | [`search_by_name_or_id`] | context assembly, roster fallback |
//! | [`resolve_mention`] | context assembly, mention from a query |

use anyhow::Result;
use rapidfuzz::fuzz;
use tracing::debug;

use crate::config::IdentityConfig;
use crate::mention;
use crate::models::{Patient, PatientMatch};
use crate::store::Store;

/// Lowercase and drop whitespace, `-` and `_`.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Similarity on a 0–100 scale: the indel ratio
/// `round(200 * LCS / (len_a + len_b))` over Unicode scalar values.
///
/// Two empty strings are identical; an empty string matches nothing else.
pub fn ratio(a: &str, b: &str) -> u8 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 100,
        (true, false) | (false, true) => return 0,
        _ => {}
    }
    (fuzz::ratio(a.chars(), b.chars()) * 100.0).round() as u8
}

/// Return the id of the patient `name`/`external_id` refers to, creating one
/// if nobody matches.
///
/// An exact normalized-name hit (with a compatible id) wins. Otherwise every
/// patient is scored; name similarity above `name_threshold` merges, and when
/// both sides carry an id that must also score above `id_threshold`.
pub async fn find_or_create(
    store: &Store,
    cfg: &IdentityConfig,
    name: &str,
    external_id: Option<&str>,
) -> Result<i64> {
    let external_id = external_id.map(str::trim).filter(|s| !s.is_empty());
    let name_norm = normalize(name);
    let id_norm = external_id.map(normalize).unwrap_or_default();

    if let Some(id) = store.find_patient_exact(&name_norm, &id_norm).await? {
        store.touch_patient(id).await?;
        return Ok(id);
    }

    for candidate in store.all_patients().await? {
        if ratio(&name_norm, &candidate.normalized_name) <= cfg.name_threshold {
            continue;
        }
        if !id_norm.is_empty()
            && !candidate.normalized_id.is_empty()
            && ratio(&id_norm, &candidate.normalized_id) <= cfg.id_threshold
        {
            continue;
        }

        debug!(
            name,
            matched = %candidate.display_name,
            patient_id = candidate.id,
            "Merged with existing patient"
        );
        store.touch_patient(candidate.id).await?;
        return Ok(candidate.id);
    }

    let id = store
        .insert_patient(name.trim(), external_id, &name_norm, &id_norm)
        .await?;
    debug!(name, patient_id = id, "Created patient");
    Ok(id)
}

/// Patients whose normalized name or id contains the normalized query, or
/// whose documents/image transcriptions contain the raw query.
pub async fn search_by_name_or_id(store: &Store, query: &str) -> Result<Vec<PatientMatch>> {
    store.search_patients(&normalize(query), query).await
}

/// Resolve a mentioned name or id to a stored patient.
///
/// Ids use an exact normalized lookup. Names are scored against every
/// patient's full name and, for single-word candidates, each word of it;
/// the best score must reach `mention_threshold`. Equal scores prefer the
/// patient whose name appears in `fallback_query`.
pub async fn resolve_mention(
    store: &Store,
    cfg: &IdentityConfig,
    candidate: &str,
    fallback_query: &str,
) -> Result<Option<Patient>> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return Ok(None);
    }

    if mention::is_patient_id(candidate) {
        return store.find_patient_by_normalized_id(&normalize(candidate)).await;
    }

    let cand_norm = normalize(candidate);
    let single_word = !candidate.contains(char::is_whitespace);
    let query_lower = fallback_query.to_lowercase();

    let mut best: Option<(u8, bool, Patient)> = None;
    for patient in store.all_patients().await? {
        let mut score = ratio(&cand_norm, &patient.normalized_name);
        if single_word {
            for part in patient.display_name.split_whitespace() {
                score = score.max(ratio(&cand_norm, &normalize(part)));
            }
        }
        let named_in_query = query_lower.contains(&patient.display_name.to_lowercase());

        let better = match &best {
            None => true,
            Some((s, named, _)) => score > *s || (score == *s && named_in_query && !named),
        };
        if better {
            best = Some((score, named_in_query, patient));
        }
    }

    match best {
        Some((score, _, patient)) if score >= cfg.mention_threshold => {
            debug!(candidate, matched = %patient.display_name, score, "Resolved mention");
            Ok(Some(patient))
        }
        Some((score, _, patient)) => {
            debug!(
                candidate,
                closest = %patient.display_name,
                score,
                "Mention below threshold"
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&Config::minimal(tmp.path())).await.unwrap();
        (tmp, store)
    }

    #[test]
    fn normalize_strips_case_and_separators() {
        assert_eq!(normalize("John Smith"), "johnsmith");
        assert_eq!(normalize("john-smith"), "johnsmith");
        assert_eq!(normalize("JOHN_SMITH"), "johnsmith");
        assert_eq!(normalize("  "), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn ratio_matches_indel_similarity() {
        assert_eq!(ratio("", ""), 100);
        assert_eq!(ratio("abc", ""), 0);
        assert_eq!(ratio("johnsmith", "johnsmith"), 100);
        // LCS 8, lengths 8 + 9
        assert_eq!(ratio("jonsmith", "johnsmith"), 94);
        assert_eq!(ratio("alicemore", "alicemoore"), 95);
        assert_eq!(ratio("m0001", "m0001"), 100);
        assert!(ratio("johnsmith", "robertjones") < 50);
    }

    #[tokio::test]
    async fn spelling_variants_merge() {
        let (_tmp, store) = open_store().await;
        let cfg = IdentityConfig::default();

        let a = find_or_create(&store, &cfg, "John Smith", None).await.unwrap();
        let b = find_or_create(&store, &cfg, "john-smith", None).await.unwrap();
        let c = find_or_create(&store, &cfg, "Jon Smith", None).await.unwrap();
        let d = find_or_create(&store, &cfg, "Robert Jones", None).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, d);
        assert_eq!(store.stats().await.unwrap().total_patients, 2);
    }

    #[tokio::test]
    async fn conflicting_ids_keep_patients_apart() {
        let (_tmp, store) = open_store().await;
        let cfg = IdentityConfig::default();

        let a = find_or_create(&store, &cfg, "John Smith", Some("M0001")).await.unwrap();
        let b = find_or_create(&store, &cfg, "Jon Smith", Some("Q9876")).await.unwrap();
        let c = find_or_create(&store, &cfg, "John Smith", Some("M0001")).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn mention_resolution_by_id_and_name() {
        let (_tmp, store) = open_store().await;
        let cfg = IdentityConfig::default();
        let alice = find_or_create(&store, &cfg, "Alice Moore", Some("M0001")).await.unwrap();
        let bob = find_or_create(&store, &cfg, "Bob Stone", Some("M0002")).await.unwrap();

        let by_id = resolve_mention(&store, &cfg, "m0002", "").await.unwrap();
        assert_eq!(by_id.map(|p| p.id), Some(bob));

        let by_name = resolve_mention(&store, &cfg, "Alice More", "").await.unwrap();
        assert_eq!(by_name.map(|p| p.id), Some(alice));

        let first_only = resolve_mention(&store, &cfg, "Alice", "").await.unwrap();
        assert_eq!(first_only.map(|p| p.id), Some(alice));

        let unknown = resolve_mention(&store, &cfg, "Zebediah Quackenbush", "").await.unwrap();
        assert!(unknown.is_none());

        let missing_id = resolve_mention(&store, &cfg, "X9999", "").await.unwrap();
        assert!(missing_id.is_none());
    }

    #[tokio::test]
    async fn equal_scores_prefer_name_in_query() {
        let (_tmp, store) = open_store().await;
        let cfg = IdentityConfig::default();
        find_or_create(&store, &cfg, "Sam Lee", None).await.unwrap();
        let sam_park = find_or_create(&store, &cfg, "Sam Park", None).await.unwrap();

        let hit = resolve_mention(&store, &cfg, "Sam", "what did Sam Park have")
            .await
            .unwrap();
        assert_eq!(hit.map(|p| p.id), Some(sam_park));
    }

    #[tokio::test]
    async fn search_finds_by_normalized_name() {
        let (_tmp, store) = open_store().await;
        let cfg = IdentityConfig::default();
        let id = find_or_create(&store, &cfg, "Alice Moore", None).await.unwrap();

        let hits = search_by_name_or_id(&store, "alice-moore").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }
}
