//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] validates thresholds and provider names so that a
//! bad configuration fails at startup instead of halfway through an ingestion
//! run.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_root")]
    pub root: PathBuf,
    /// Primary spreadsheet, relative to `root` unless absolute.
    #[serde(default = "default_spreadsheet")]
    pub spreadsheet: PathBuf,
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: default_dataset_root(),
            spreadsheet: default_spreadsheet(),
            images_dir: default_images_dir(),
            documents_dir: default_documents_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl DatasetConfig {
    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn spreadsheet_path(&self) -> PathBuf {
        self.resolve(&self.spreadsheet)
    }

    pub fn images_path(&self) -> PathBuf {
        self.resolve(&self.images_dir)
    }

    pub fn documents_path(&self) -> PathBuf {
        self.resolve(&self.documents_dir)
    }
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("dataset")
}
fn default_spreadsheet() -> PathBuf {
    PathBuf::from("documents/clinical_data.xlsx")
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_documents_dir() -> PathBuf {
    PathBuf::from("documents")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.txt".to_string(),
    ]
}

/// Fuzzy-matching thresholds on the 0–100 similarity scale.
#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Name similarity must be strictly greater than this to merge.
    #[serde(default = "default_name_threshold")]
    pub name_threshold: u8,
    /// When both sides carry an id, id similarity must exceed this too.
    #[serde(default = "default_id_threshold")]
    pub id_threshold: u8,
    /// Minimum score for a name mentioned in a query to count as a patient.
    #[serde(default = "default_mention_threshold")]
    pub mention_threshold: u8,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name_threshold: default_name_threshold(),
            id_threshold: default_id_threshold(),
            mention_threshold: default_mention_threshold(),
        }
    }
}

fn default_name_threshold() -> u8 {
    90
}
fn default_id_threshold() -> u8 {
    85
}
fn default_mention_threshold() -> u8 {
    80
}

/// Bounds on the serialized context handed to the generator.
#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_document_chars")]
    pub document_chars: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_image_chars")]
    pub image_chars: usize,
    #[serde(default = "default_max_roster_patients")]
    pub max_roster_patients: usize,
    #[serde(default = "default_aggregate_entries")]
    pub aggregate_entries: usize,
    #[serde(default = "default_aggregate_chars")]
    pub aggregate_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            document_chars: default_document_chars(),
            max_images: default_max_images(),
            image_chars: default_image_chars(),
            max_roster_patients: default_max_roster_patients(),
            aggregate_entries: default_aggregate_entries(),
            aggregate_chars: default_aggregate_chars(),
        }
    }
}

fn default_max_documents() -> usize {
    10
}
fn default_document_chars() -> usize {
    1000
}
fn default_max_images() -> usize {
    5
}
fn default_image_chars() -> usize {
    800
}
fn default_max_roster_patients() -> usize {
    5
}
fn default_aggregate_entries() -> usize {
    50
}
fn default_aggregate_chars() -> usize {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL override (OpenAI-compatible servers, proxies, tests).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name, falling back to the provider's default.
    pub fn model_name(&self) -> String {
        if let Some(m) = &self.model {
            return m.clone();
        }
        match self.provider.as_str() {
            "gemini" => "gemini-1.5-flash".to_string(),
            "openai" => "gpt-4o-mini".to_string(),
            _ => "disabled".to_string(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VisionConfig {
    /// Use the generation provider's vision endpoint for image analysis.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A config rooted at `root` with every collaborator disabled.
    pub fn minimal(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("medctx.sqlite"),
            },
            dataset: DatasetConfig {
                root: root.join("dataset"),
                ..DatasetConfig::default()
            },
            identity: IdentityConfig::default(),
            context: ContextConfig::default(),
            generation: GenerationConfig::default(),
            vision: VisionConfig::default(),
            ocr: OcrConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, value) in [
        ("identity.name_threshold", config.identity.name_threshold),
        ("identity.id_threshold", config.identity.id_threshold),
        ("identity.mention_threshold", config.identity.mention_threshold),
    ] {
        if value > 100 {
            bail!("{} must be in [0, 100]", name);
        }
    }

    if config.context.max_documents == 0 || config.context.document_chars == 0 {
        bail!("context.max_documents and context.document_chars must be > 0");
    }

    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "gemini" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or gemini.",
            other
        ),
    }

    if config.vision.enabled && !config.generation.is_enabled() {
        bail!("vision.enabled requires a generation provider");
    }

    match config.ocr.provider.as_str() {
        "disabled" | "google" => {}
        other => bail!(
            "Unknown ocr provider: '{}'. Must be disabled or google.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let src = format!("[db]\npath = \"/tmp/x.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let config = parse("").unwrap();
        assert_eq!(config.identity.name_threshold, 90);
        assert_eq!(config.identity.id_threshold, 85);
        assert_eq!(config.context.max_documents, 10);
        assert_eq!(config.context.aggregate_entries, 50);
        assert!(!config.generation.is_enabled());
        assert_eq!(
            config.dataset.spreadsheet_path(),
            PathBuf::from("dataset/documents/clinical_data.xlsx")
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = parse("[generation]\nprovider = \"claude_cli\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn vision_without_generator_is_rejected() {
        assert!(parse("[vision]\nenabled = true\n").is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        assert!(parse("[identity]\nmention_threshold = 101\n").is_err());
    }
}
