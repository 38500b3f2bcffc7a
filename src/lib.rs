//! Conversation Usage Library
//!
//! Token and cost analysis for exported chat-conversation dumps. Each export
//! stores a conversation as a tree of message nodes; this library rebuilds
//! the linear thread, counts tokens per turn with the model's BPE encoding,
//! prices them per model, and rolls the results up across a dataset.
//!
//! ## Core Features
//!
//! - **Tree reconstruction**: iterative, cycle-safe ordering with a configurable
//!   branch policy
//! - **Exact tokens where possible**: `tiktoken` encodings per model, with an
//!   approximate counter (and a flag) for unknown models
//! - **Exact money**: costs accumulate as decimals and are rounded only on output
//! - **Resilient input**: bad data becomes annotations, never a failed run
//! - **Flexible output formats**: colored text, JSON and CSV reports
//!
//! ## Architecture Overview
//!
//! - [`models`] - Export records, turns and analysis results
//! - [`ordering`] - Message tree to linear sequence
//! - [`tokenizer`] - Encoding selection and token counting
//! - [`classifier`] - Per-turn content classification and counting
//! - [`pricing`] - Rate lookup with fallbacks and cost aggregation
//! - [`analyzer`] - Per-conversation pipeline and batch runs
//! - [`rollup`] - Dataset-level summaries
//! - [`loader`] / [`filters`] / [`inspect`] - Input, selection and inspection
//! - [`report`] - Output formatting
//! - [`config`] - Configuration management with environment variable support
//! - [`logging`] - Structured logging with JSON and pretty-print formats
//!
//! ## Main Entry Point
//!
//! ```rust
//! use convo_usage::{Analyzer, Conversation, Mode};
//!
//! let conversation: Conversation = serde_json::from_str(r#"{
//!     "id": "c1",
//!     "mapping": {
//!         "root": {"id": "root", "children": ["m1"]},
//!         "m1": {"id": "m1", "parent": "root", "message": {
//!             "author": {"role": "user"},
//!             "content": {"content_type": "text", "parts": ["hi"]},
//!             "end_turn": true
//!         }}
//!     }
//! }"#).unwrap();
//!
//! let result = Analyzer::default().analyze(&conversation, Mode::Simple);
//! assert_eq!(result.real_turns, 1);
//! assert_eq!(result.total_cost, result.model_cost_sum());
//! ```

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod filters;
pub mod inspect;
pub mod loader;
pub mod logging;
pub mod models;
pub mod ordering;
pub mod pricing;
pub mod report;
pub mod rollup;
pub mod tokenizer;

pub use analyzer::{AnalysisOptions, Analyzer, BatchOutcome};
pub use models::*;
pub use rollup::{rollup, DatasetSummary, RollupOptions};
