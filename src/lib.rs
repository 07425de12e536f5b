//! # medctx
//!
//! Local clinical record ingestion and patient-context assembly for LLM
//! question answering.
//!
//! medctx reads a clinical dataset (a primary spreadsheet of patient rows,
//! associated medical images, and loose PDF/DOCX/TXT documents) into a
//! SQLite record store, resolving every record to a canonical patient. At
//! question time it decides whether the question is about one patient, a
//! handful of matching patients, or the whole population, and assembles a
//! bounded context for the generator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │   Dataset    │──▶│  Ingestion   │──▶│  SQLite  │
//! │ xlsx/img/pdf │   │ OCR + Vision │   │  Store   │
//! └──────────────┘   └──────────────┘   └────┬─────┘
//!                                            │
//!                                            ▼
//!                    ┌──────────┐      ┌───────────┐
//!                    │   Chat   │◀─────│  Context  │
//!                    │ (medctx) │      │ Assembler │
//!                    └──────────┘      └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! medctx init                              # create database
//! medctx ingest                            # process new or changed files
//! medctx ask "How many patients are there?"
//! medctx chat                              # interactive session
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | SQLite record store |
//! | [`identity`] | Name normalization, fuzzy matching, patient resolution |
//! | [`mention`] | Patient mentions and aggregate cues in free text |
//! | [`context`] | Context assembly and conversation state |
//! | [`scan`] | Dataset discovery and fingerprints |
//! | [`spreadsheet`] | Primary spreadsheet reader |
//! | [`extract`] | PDF/DOCX/TXT text extraction |
//! | [`imaging`] | Image categorization and analysis |
//! | [`ingest`] | Ingestion pipeline |
//! | [`llm`] | Generation and vision providers |
//! | [`ocr`] | Text extraction from images |
//! | [`chat`] | Chat session layer |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod extract;
pub mod identity;
pub mod imaging;
pub mod ingest;
pub mod llm;
pub mod mention;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod prompts;
pub mod scan;
pub mod search;
pub mod spreadsheet;
pub mod stats;
pub mod store;
