//! Query classification and patient-mention extraction.
//!
//! Everything here is a pure function over the query text. Turning a
//! [`Mention`] into a stored patient is the job of
//! [`identity::resolve_mention`](crate::identity::resolve_mention).

use regex::Regex;
use std::sync::LazyLock;

/// A patient reference found in free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mention {
    /// An external patient id, upper-cased (`M0001`).
    ById(String),
    /// A candidate name, as written in the query.
    ByName(String),
}

impl Mention {
    pub fn as_str(&self) -> &str {
        match self {
            Mention::ById(s) | Mention::ByName(s) => s,
        }
    }
}

static PATIENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[a-z]{1,3}\d{4}\b").expect("valid id pattern"));

static PATIENT_ID_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z]{1,3}\d{4}$").expect("valid id pattern"));

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"([A-Z][a-z]+ [A-Z][a-z]+)'s\s",
        r"([A-Z][a-z]+ [A-Z][a-z]+)'\s",
        r"([A-Z][a-z]+ [A-Z]\. [A-Z][a-z]+)'s?\s",
        r"\b([A-Z][a-z]+ [A-Z][a-z]+)\s+(?:medical|history|record|condition|diagnosis|treatment)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid name pattern"))
    .collect()
});

/// Phrases after which a patient name usually follows, tried in order.
const LEAD_INS: &[&str] = &[
    "patient ",
    "what did ",
    "about ",
    "for ",
    "diagnosis for ",
    "treatment for ",
    "results for ",
    "data for ",
    "information on ",
    "info on ",
    "report on ",
    "record of ",
    "records for ",
    "history of ",
    "condition of ",
    "status of ",
    "case of ",
    " with ",
];

/// Words that end a captured name.
const STOP_WORDS: &[&str] = &[
    "have", "had", "do", "does", "was", "is", "what", "when", "where", "how", "why", "?", "and",
    "or", "but", "with", "without", "the", "a", "an", "his", "her", "their", "diabetes", "cancer",
    "heart", "disease", "condition", "diagnosis", "treatment", "medication", "surgery", "test",
    "scan", "mri", "ct", "xray", "blood", "him", "them", "they", "he", "she", "it", "this", "that",
    "these", "those", "patient", "person", "individual", "case", "subject",
];

const PRONOUNS: &[&str] = &[
    "him", "her", "them", "they", "he", "she", "it", "this", "that", "these", "those",
];

/// Cue phrases that mark a question about the whole population.
const AGGREGATE_CUES: &[&str] = &[
    "how many patients",
    "patient count",
    "total patients",
    "number of patients",
    "database stats",
    "statistics",
    "how many",
    "count",
    "total",
    "summary",
    "overview",
    "all patients",
    "patient list",
    "common disease",
    "most common",
    "frequent disease",
    "majority",
    "prevalent",
    "what disease",
    "which disease",
    "disease found",
    "diagnosis found",
    "conditions found",
    "most frequent",
    "common condition",
    "popular disease",
    "disease pattern",
    "health trend",
    "medical trend",
    "diagnosis trend",
    "analyze",
    "analysis",
    "trend",
    "pattern",
    "distribution",
    "breakdown",
    "what are the",
    "show me all",
    "list all",
    "across all",
    "in the database",
    "among patients",
    "in patients",
    "patient analysis",
];

const MAX_NAME_WORDS: usize = 4;

/// True when `s` is exactly an external patient id (1–3 letters, 4 digits).
pub fn is_patient_id(s: &str) -> bool {
    PATIENT_ID_EXACT.is_match(s.trim())
}

/// First patient id anywhere in `query`, upper-cased.
pub fn find_patient_id(query: &str) -> Option<String> {
    PATIENT_ID
        .find(query)
        .map(|m| m.as_str().to_ascii_uppercase())
}

pub fn is_aggregate_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    AGGREGATE_CUES.iter().any(|cue| lower.contains(cue))
}

/// Find the patient a query refers to, if any.
///
/// Ids win over names. Names are looked for after lead-in phrases first and
/// then by capitalized two-word patterns.
pub fn extract_mention(query: &str) -> Option<Mention> {
    if let Some(id) = find_patient_id(query) {
        return Some(Mention::ById(id));
    }

    if let Some(name) = name_after_lead_in(query) {
        return Some(Mention::ByName(name));
    }

    for pattern in NAME_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(query) {
            let name = caps[1].trim();
            if !PRONOUNS.contains(&name.to_lowercase().as_str()) {
                return Some(Mention::ByName(name.to_string()));
            }
        }
    }

    None
}

fn name_after_lead_in(query: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `query`.
    let lower = query.to_ascii_lowercase();

    for phrase in LEAD_INS {
        let Some(pos) = lower.find(phrase) else {
            continue;
        };
        let rest = &query[pos + phrase.len()..];

        let mut words = Vec::new();
        for word in rest.split_whitespace() {
            let clean = word
                .trim_matches(|c| matches!(c, '.' | ',' | '?' | '!'))
                .to_lowercase();
            if clean.chars().count() <= 1 || STOP_WORDS.contains(&clean.as_str()) {
                break;
            }
            words.push(word);
        }

        if words.is_empty() || words.len() > MAX_NAME_WORDS {
            continue;
        }

        let joined = words.join(" ");
        let name = strip_possessive(joined.trim_matches(|c| matches!(c, '.' | ',' | '?' | '!')));
        if name.is_empty() || PRONOUNS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        return Some(name.to_string());
    }

    None
}

fn strip_possessive(s: &str) -> &str {
    s.strip_suffix("'s")
        .or_else(|| s.strip_suffix("’s"))
        .or_else(|| s.strip_suffix('\''))
        .unwrap_or(s)
}
