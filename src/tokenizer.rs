//! Token counting
//!
//! Wraps `tiktoken-rs` BPE encodings behind the [`TokenCounter`] trait and
//! resolves which encoding a model slug uses. Slugs the BPE tables do not know
//! fall back to [`ApproximateCounter`], and the returned [`TokenCount`] says so.

use crate::models::ModelId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Counts tokens in a single string.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
    P50kBase,
    R50kBase,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::O200kBase => "o200k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::R50kBase => "r50k_base",
        }
    }

    /// Encoding tiktoken associates with a model name, if any.
    pub fn for_model(model: &str) -> Option<Self> {
        use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};

        match get_tokenizer(model)? {
            Tokenizer::Cl100kBase => Some(Encoding::Cl100kBase),
            Tokenizer::O200kBase => Some(Encoding::O200kBase),
            Tokenizer::P50kBase | Tokenizer::P50kEdit => Some(Encoding::P50kBase),
            Tokenizer::R50kBase | Tokenizer::Gpt2 => Some(Encoding::R50kBase),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Shared BPE table, loaded on first use. `None` if the table failed to load.
    fn bpe(self) -> Option<&'static CoreBPE> {
        static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
        static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
        static P50K: OnceLock<Option<CoreBPE>> = OnceLock::new();
        static R50K: OnceLock<Option<CoreBPE>> = OnceLock::new();

        let (cell, load): (&OnceLock<Option<CoreBPE>>, fn() -> anyhow::Result<CoreBPE>) = match self {
            Encoding::Cl100kBase => (&CL100K, tiktoken_rs::cl100k_base),
            Encoding::O200kBase => (&O200K, tiktoken_rs::o200k_base),
            Encoding::P50kBase => (&P50K, tiktoken_rs::p50k_base),
            Encoding::R50kBase => (&R50K, tiktoken_rs::r50k_base),
        };

        cell.get_or_init(|| match load() {
            Ok(bpe) => {
                debug!(encoding = self.name(), "Loaded BPE table");
                Some(bpe)
            }
            Err(e) => {
                warn!(encoding = self.name(), error = %e, "Failed to load BPE table");
                None
            }
        })
        .as_ref()
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cl100k_base" => Ok(Encoding::Cl100kBase),
            "o200k_base" => Ok(Encoding::O200kBase),
            "p50k_base" => Ok(Encoding::P50kBase),
            "r50k_base" => Ok(Encoding::R50kBase),
            other => anyhow::bail!("Unknown tokenizer encoding: {}", other),
        }
    }
}

/// Exact BPE counter for one encoding.
pub struct BpeCounter {
    bpe: &'static CoreBPE,
}

impl BpeCounter {
    pub fn new(encoding: Encoding) -> Option<Self> {
        encoding.bpe().map(|bpe| Self { bpe })
    }
}

impl TokenCounter for BpeCounter {
    fn count_tokens(&self, text: &str) -> u64 {
        // Special tokens such as <|endoftext|> are counted as ordinary text.
        self.bpe.encode_ordinary(text).len() as u64
    }
}

/// Heuristic counter: one token per four characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateCounter;

impl TokenCounter for ApproximateCounter {
    fn count_tokens(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(4)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub tokens: u64,
    pub approximate: bool,
}

/// Model-aware counter used by the classifier.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    default_encoding: Encoding,
    overrides: HashMap<String, Encoding>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(Encoding::Cl100kBase, HashMap::new())
    }
}

impl Tokenizer {
    pub fn new(default_encoding: Encoding, overrides: HashMap<String, Encoding>) -> Self {
        Self {
            default_encoding,
            overrides,
        }
    }

    /// Encoding for a resolved model. `None` means the slug is unknown to the BPE tables.
    pub fn encoding_for(&self, model: &ModelId) -> Option<Encoding> {
        match model {
            ModelId::Unspecified => Some(self.default_encoding),
            ModelId::Named(slug) => self
                .overrides
                .get(slug)
                .copied()
                .or_else(|| Encoding::for_model(slug)),
        }
    }

    pub fn count(&self, text: &str, model: &ModelId) -> TokenCount {
        if text.is_empty() {
            return TokenCount::default();
        }

        let exact = self.encoding_for(model).and_then(BpeCounter::new);
        match exact {
            Some(counter) => TokenCount {
                tokens: counter.count_tokens(text),
                approximate: false,
            },
            None => TokenCount {
                tokens: ApproximateCounter.count_tokens(text),
                approximate: true,
            },
        }
    }
}
