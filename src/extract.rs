//! Text extraction for supplementary clinical documents (PDF, DOCX, TXT),
//! plus the heuristics that decide which patient a loose document belongs to.
//!
//! Extraction never panics on bad input: a broken file becomes an
//! [`ExtractError`] and the pipeline records it and moves on.

use regex::Regex;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

use crate::mention;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
pub(crate) const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("text file is not valid UTF-8")]
    InvalidUtf8,
}

/// File type label stored on the document row.
pub fn file_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some("pdf"),
        "docx" => Some("docx"),
        "txt" => Some("txt"),
        _ => None,
    }
}

/// Extract plain text from a supplementary document's bytes.
pub fn extract_document_text(path: &Path, bytes: &[u8]) -> Result<String, ExtractError> {
    let text = match file_type_for(path) {
        Some("pdf") => extract_pdf(bytes)?,
        Some("docx") => extract_docx(bytes)?,
        Some("txt") => String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::InvalidUtf8)?,
        _ => {
            return Err(ExtractError::UnsupportedFileType(
                path.display().to_string(),
            ))
        }
    };
    Ok(text.trim().to_string())
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Read one ZIP entry, refusing anything larger than `max_bytes`.
pub(crate) fn read_zip_entry_bounded<R: std::io::Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        ));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Docx(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)
        .map_err(ExtractError::Docx)?;
    docx_paragraphs(&xml)
}

/// Collect `w:t` runs, one line per paragraph (`w:p`) and table row (`w:tr`).
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut line = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tc" if !line.is_empty() => line.push(' '),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                line.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Empty(e)) if matches!(e.local_name().as_ref(), b"tab" | b"br") => {
                line.push(' ');
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" | b"tr" => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        out.push_str(trimmed);
                        out.push('\n');
                    }
                    line.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !line.trim().is_empty() {
        out.push_str(line.trim());
    }
    Ok(out)
}

// ── Patient inference ───────────────────────────────────────────────────

static NAME_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:patient\s+name|patient|name)\s*:\s*([A-Za-z][A-Za-z .'\-]{1,60}?)\s*$")
        .expect("valid name label pattern")
});

static ID_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:patient\s*id|mrn|medical\s*record)\s*[:#]?\s*([A-Za-z0-9\-]{2,19})\b")
        .expect("valid id label pattern")
});

/// Folder names that never identify a patient.
const GENERIC_FOLDERS: &[&str] = &[
    "dataset", "documents", "images", "files", "data", "medical", "records", "reports",
];

/// Patient name and id declared inside the document text, if any.
pub fn patient_from_text(text: &str) -> (Option<String>, Option<String>) {
    let name = NAME_LABEL
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|n| {
            let lower = n.to_lowercase();
            n.chars().count() > 1 && !["id", "unknown", "description", "image"].contains(&lower.as_str())
        });

    let id = ID_LABEL
        .captures(text)
        .map(|c| c[1].to_string())
        .or_else(|| mention::find_patient_id(text));

    (name, id)
}

/// Best-effort patient name from a document path relative to the documents root.
///
/// Tried in order: a folder marked as a patient/case/episode/record folder,
/// the first `_`-separated token of the file stem, up to three leading words
/// of a space-separated stem, any non-generic folder, the bare stem.
pub fn patient_from_path(relative: &Path) -> String {
    let folders: Vec<String> = relative
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| c.as_os_str().to_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let stem = relative
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let tidy = |s: &str| s.replace(['_', '-'], " ").trim().to_string();

    for folder in &folders {
        let lower = folder.to_lowercase();
        if ["episode", "patient", "case", "record"]
            .iter()
            .any(|k| lower.contains(k))
        {
            let mut name = folder.clone();
            for suffix in ["_Episode", "_Patient", "_Case", "_Record"] {
                name = name.replace(suffix, "");
            }
            let name = tidy(&name);
            if name.chars().count() > 2 {
                return name;
            }
        }
    }

    if let Some((first, _)) = stem.split_once('_') {
        if first.chars().count() > 2 && first.chars().any(char::is_alphabetic) {
            return first.replace('-', " ").trim().to_string();
        }
    }

    if stem.contains(' ') {
        let words: Vec<&str> = stem
            .split_whitespace()
            .take(3)
            .take_while(|w| w.chars().count() > 1 && w.chars().any(char::is_alphabetic))
            .collect();
        if !words.is_empty() {
            return words.join(" ");
        }
    }

    for folder in &folders {
        if !GENERIC_FOLDERS.contains(&folder.to_lowercase().as_str()) && folder.chars().count() > 2 {
            return tidy(folder);
        }
    }

    let name = tidy(&stem);
    if name.is_empty() {
        "Unknown Patient".to_string()
    } else {
        name
    }
}
