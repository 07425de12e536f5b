//! Medical image handling: locating the file a spreadsheet row points at,
//! categorizing it from its folders, and combining text extraction with
//! vision analysis into the stored transcription.
//!
//! | Outcome | Stored transcription |
//! |---------|----------------------|
//! | vision ok | formatted visual analysis, plus `EXTRACTED TEXT:` when OCR found text |
//! | vision failed, OCR text | patient/category header + `Extracted Text Analysis:` |
//! | neither | patient/category header + "analysis not available" note |

use serde_json::json;
use std::path::{Component, Path, PathBuf};

use crate::llm::VisionAnalyzer;
use crate::ocr::{TextExtraction, TextExtractor};
use crate::prompts::vision_prompt;

/// Path keywords, checked in order against each folder name. Keywords of
/// three letters or fewer must equal a whole folder token (see
/// [`folder_tokens`]); longer ones match anywhere in the name.
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("ct", "CT Scan"),
    ("mri", "MRI"),
    ("xray", "X-Ray"),
    ("cxr", "Chest X-Ray"),
    ("ultrasound", "Ultrasound"),
    ("echo", "Echocardiogram"),
    ("mammogram", "Mammogram"),
    ("abdomen", "Abdominal Imaging"),
    ("chest", "Chest Imaging"),
    ("head", "Head Imaging"),
    ("brain", "Brain Imaging"),
    ("spine", "Spine Imaging"),
    ("hand", "Hand Imaging"),
    ("foot", "Foot Imaging"),
    ("breast", "Breast Imaging"),
    ("cardiac", "Cardiac Imaging"),
    ("lung", "Lung Imaging"),
    ("liver", "Liver Imaging"),
    ("kidney", "Kidney Imaging"),
];

/// Category for an image path relative to the images root.
///
/// Only folder names are inspected; file names are too noisy for substring
/// keywords such as `ct`.
pub fn image_category(relative: &Path) -> String {
    let folders: Vec<String> = relative
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => s.to_str().map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    for folder in &folders {
        let lower = folder.to_lowercase();
        let tokens = folder_tokens(folder);
        for (keyword, category) in CATEGORY_KEYWORDS {
            let hit = if keyword.len() <= 3 {
                tokens.iter().any(|t| t == keyword)
            } else {
                lower.contains(keyword)
            };
            if hit {
                return (*category).to_string();
            }
        }
    }

    match folders.last() {
        Some(parent) => format!("Medical Image - {}", parent),
        None => "Medical Image - Uncategorized".to_string(),
    }
}

/// Lowercase words of a folder name, split on separators and case changes:
/// `HeadCT` gives `head`, `ct`; `Doctor_Notes` gives `doctor`, `notes`.
fn folder_tokens(folder: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for piece in folder.split(|c: char| !c.is_alphanumeric()).filter(|p| !p.is_empty()) {
        let chars: Vec<char> = piece.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            let boundary = i > 0
                && c.is_uppercase()
                && (chars[i - 1].is_lowercase()
                    || (chars[i - 1].is_uppercase()
                        && chars.get(i + 1).is_some_and(|n| n.is_lowercase())));
            if boundary && !current.is_empty() {
                tokens.push(current.to_lowercase());
                current.clear();
            }
            current.push(c);
        }
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
        }
    }
    tokens
}

/// Spreadsheet image reference relative to the images root.
///
/// A leading `images/` (or `images\`) is dropped and separators become `/`.
pub fn relative_image_path(raw: &str) -> PathBuf {
    let unified = raw.trim().replace('\\', "/");
    let trimmed = unified.trim_start_matches("./");
    let stripped = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("images/") => &trimmed[7..],
        _ => trimmed,
    };
    PathBuf::from(stripped.trim_start_matches('/'))
}

pub fn resolve_image_path(images_root: &Path, raw: &str) -> PathBuf {
    images_root.join(relative_image_path(raw))
}

pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Who the image belongs to, passed through to prompts and headers.
#[derive(Debug, Clone, Copy)]
pub struct ImageSubject<'a> {
    pub patient_name: &'a str,
    pub patient_id: &'a str,
    pub category: &'a str,
    /// Excerpt of the patient's most recent document, or empty.
    pub clinical_context: &'a str,
}

#[derive(Debug, Clone)]
pub struct ImageAnalysis {
    pub text_extraction: TextExtraction,
    /// Formatted visual analysis, or the failure message.
    pub visual_analysis: Result<String, String>,
    pub combined: String,
    pub processing_method: &'static str,
}

impl ImageAnalysis {
    pub fn metadata(&self, subject: &ImageSubject<'_>) -> serde_json::Value {
        let visual = match &self.visual_analysis {
            Ok(text) => text.clone(),
            Err(e) => format!("Visual analysis failed: {}", e),
        };
        json!({
            "patient_name": subject.patient_name,
            "patient_id": subject.patient_id,
            "processing_method": self.processing_method,
            "text_extraction": self.text_extraction.describe(),
            "visual_analysis": visual,
            "processing_status": if self.visual_analysis.is_ok() { "success" } else { "partial_success" },
        })
    }
}

/// Clinical context line for the vision prompt, from the newest document.
pub fn clinical_context_from(latest_document: Option<&str>) -> String {
    match latest_document {
        Some(text) if !text.trim().is_empty() => {
            let excerpt: String = text.chars().take(800).collect();
            format!("Clinical History: {}...", excerpt)
        }
        _ => String::new(),
    }
}

/// Run text extraction and vision analysis, then combine them.
pub async fn analyze_image(
    vision: &dyn VisionAnalyzer,
    ocr: &dyn TextExtractor,
    image: &[u8],
    mime: &str,
    subject: &ImageSubject<'_>,
) -> ImageAnalysis {
    let text_extraction = ocr.extract_text(image).await;

    let prompt = vision_prompt(
        subject.patient_name,
        subject.patient_id,
        subject.category,
        subject.clinical_context,
    );
    let visual_analysis = match vision.analyze_image(image, mime, &prompt).await {
        Ok(text) if !text.trim().is_empty() => Ok(format!(
            "PATIENT: {} (ID: {})\nIMAGE TYPE: {}\nAI VISUAL ANALYSIS:\n\n{}",
            subject.patient_name,
            subject.patient_id,
            subject.category,
            text.trim()
        )),
        Ok(_) => Err("empty analysis".to_string()),
        Err(e) => Err(e.to_string()),
    };

    combine(text_extraction, visual_analysis, subject)
}

fn combine(
    text_extraction: TextExtraction,
    visual_analysis: Result<String, String>,
    subject: &ImageSubject<'_>,
) -> ImageAnalysis {
    let header = format!(
        "Patient: {} (ID: {})\nImage Category: {}",
        subject.patient_name, subject.patient_id, subject.category
    );

    let (combined, processing_method) = match (&visual_analysis, text_extraction.text()) {
        (Ok(visual), Some(text)) => (
            format!("{}\n\nEXTRACTED TEXT:\n{}", visual, text),
            "Text extraction + vision analysis",
        ),
        (Ok(visual), None) => (visual.clone(), "Vision analysis only"),
        (Err(_), Some(text)) => (
            format!("{}\n\nExtracted Text Analysis:\n{}", header, text),
            "Text extraction only",
        ),
        (Err(_), None) => (
            format!("{}\nNote: Image analysis not available", header),
            "Basic metadata only",
        ),
    };

    ImageAnalysis {
        text_extraction,
        visual_analysis,
        combined,
        processing_method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Disabled, GenerationError};
    use async_trait::async_trait;

    struct FixedVision(&'static str);

    #[async_trait]
    impl VisionAnalyzer for FixedVision {
        async fn analyze_image(&self, _: &[u8], _: &str, _: &str) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    struct FixedOcr(TextExtraction);

    #[async_trait]
    impl TextExtractor for FixedOcr {
        async fn extract_text(&self, _: &[u8]) -> TextExtraction {
            self.0.clone()
        }
    }

    fn subject() -> ImageSubject<'static> {
        ImageSubject {
            patient_name: "Jane Doe",
            patient_id: "M0007",
            category: "CT Scan",
            clinical_context: "",
        }
    }

    #[test]
    fn short_keywords_need_a_whole_token() {
        assert_eq!(
            image_category(Path::new("Doctor_Notes/a.png")),
            "Medical Image - Doctor_Notes"
        );
        assert_eq!(image_category(Path::new("Rectum/a.png")), "Medical Image - Rectum");
        assert_eq!(image_category(Path::new("spectra/a.png")), "Medical Image - spectra");
        assert_eq!(folder_tokens("HeadCT"), vec!["head", "ct"]);
        assert_eq!(folder_tokens("CTScan-2020"), vec!["ct", "scan", "2020"]);
    }

    #[test]
    fn category_from_folders() {
        assert_eq!(image_category(Path::new("HeadCT/001.png")), "CT Scan");
        assert_eq!(image_category(Path::new("cxr/a.jpg")), "Chest X-Ray");
        assert_eq!(image_category(Path::new("BreastMRI/x/y.png")), "MRI");
        assert_eq!(image_category(Path::new("Hand/0001.jpeg")), "Hand Imaging");
        assert_eq!(image_category(Path::new("ChestCT/1.png")), "CT Scan");
        assert_eq!(image_category(Path::new("chest_xray/1.png")), "X-Ray");
        assert_eq!(
            image_category(Path::new("misc/picture.png")),
            "Medical Image - misc"
        );
        assert_eq!(
            image_category(Path::new("picture.png")),
            "Medical Image - Uncategorized"
        );
    }

    #[test]
    fn image_paths_resolve_under_root() {
        let root = Path::new("/data/images");
        assert_eq!(
            resolve_image_path(root, "images/CXR/001.png"),
            PathBuf::from("/data/images/CXR/001.png")
        );
        assert_eq!(
            resolve_image_path(root, r"images\Hand\002.png"),
            PathBuf::from("/data/images/Hand/002.png")
        );
        assert_eq!(
            resolve_image_path(root, "HeadCT/003.png"),
            PathBuf::from("/data/images/HeadCT/003.png")
        );
    }

    #[test]
    fn clinical_context_is_bounded() {
        assert_eq!(clinical_context_from(None), "");
        let ctx = clinical_context_from(Some(&"x".repeat(1000)));
        assert_eq!(ctx.len(), "Clinical History: ".len() + 800 + 3);
    }

    #[tokio::test]
    async fn vision_primary_with_extracted_text() {
        let out = analyze_image(
            &FixedVision("No acute findings."),
            &FixedOcr(TextExtraction::Text("PORTABLE".into())),
            b"img",
            "image/png",
            &subject(),
        )
        .await;
        assert!(out.combined.starts_with("PATIENT: Jane Doe (ID: M0007)\nIMAGE TYPE: CT Scan"));
        assert!(out.combined.ends_with("No acute findings.\n\nEXTRACTED TEXT:\nPORTABLE"));
        assert_eq!(out.processing_method, "Text extraction + vision analysis");
    }

    #[tokio::test]
    async fn status_messages_are_never_appended() {
        let out = analyze_image(
            &FixedVision("Normal."),
            &FixedOcr(TextExtraction::NoText),
            b"img",
            "image/png",
            &subject(),
        )
        .await;
        assert!(!out.combined.contains("EXTRACTED TEXT"));
        assert!(!out.combined.contains("No text detected"));
    }

    #[tokio::test]
    async fn text_only_fallback() {
        let out = analyze_image(
            &Disabled,
            &FixedOcr(TextExtraction::Text("L R".into())),
            b"img",
            "image/png",
            &subject(),
        )
        .await;
        assert_eq!(
            out.combined,
            "Patient: Jane Doe (ID: M0007)\nImage Category: CT Scan\n\nExtracted Text Analysis:\nL R"
        );
        assert_eq!(out.metadata(&subject())["processing_status"], "partial_success");
    }

    #[tokio::test]
    async fn minimal_fallback_when_nothing_available() {
        let out = analyze_image(
            &Disabled,
            &FixedOcr(TextExtraction::NotConfigured),
            b"img",
            "image/png",
            &subject(),
        )
        .await;
        assert!(out.combined.ends_with("Note: Image analysis not available"));
        assert_eq!(out.processing_method, "Basic metadata only");
        let meta = out.metadata(&subject());
        assert!(meta["visual_analysis"]
            .as_str()
            .unwrap()
            .starts_with("Visual analysis failed"));
    }
}
