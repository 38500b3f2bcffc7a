//! Production configuration system
//!
//! Provides centralized configuration management with:
//! - Environment variable support
//! - Config file loading (optional)
//! - Runtime defaults
//! - Validation and type safety
//!
//! The analysis core never reads the global instance; it receives an
//! [`Analyzer`](crate::analyzer::Analyzer) built from an explicit `&Config`.

use crate::models::Mode;
use crate::ordering::BranchPolicy;
use crate::pricing::PricingTable;
use crate::report::ReportFormat;
use crate::rollup::{DayBucket, RollupOptions};
use crate::tokenizer::{Encoding, Tokenizer};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Token and cost calculation
    pub analysis: AnalysisConfig,

    /// Encoding selection
    pub tokenizer: TokenizerConfig,

    /// Rates per million tokens
    pub pricing: PricingTable,

    /// Report output
    pub report: ReportConfig,

    /// Paths configuration
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARN".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub mode: Mode,
    pub thought_multiplier: f64,
    pub non_text_part_tokens: u64,
    pub unsupported_part_tokens: u64,
    pub include_incomplete_turns: bool,
    /// Input-rate scale applied after the first real turn.
    pub context_discount: f64,
    pub simple_model: String,
    pub branch_policy: BranchPolicy,
    pub follow_current_node: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Detailed,
            thought_multiplier: 1.2,
            non_text_part_tokens: 0,
            unsupported_part_tokens: 0,
            include_incomplete_turns: false,
            context_discount: 0.5,
            simple_model: "o3".to_string(),
            branch_policy: BranchPolicy::LatestTimestamp,
            follow_current_node: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub default_encoding: Encoding,
    /// Slug to encoding, consulted before tiktoken's own model table.
    pub model_encodings: HashMap<String, Encoding>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        let model_encodings = [("o3", Encoding::O200kBase), ("research", Encoding::O200kBase)]
            .into_iter()
            .map(|(slug, encoding)| (slug.to_string(), encoding))
            .collect();
        Self {
            default_encoding: Encoding::Cl100kBase,
            model_encodings,
        }
    }
}

impl TokenizerConfig {
    pub fn build(&self) -> Tokenizer {
        Tokenizer::new(self.default_encoding, self.model_encodings.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub directory: PathBuf,
    pub top_n: usize,
    pub day_bucket: DayBucket,
    pub json_pretty: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::Text,
            directory: PathBuf::from("reports"),
            top_n: 10,
            day_bucket: DayBucket::Local,
            json_pretty: true,
        }
    }
}

impl ReportConfig {
    pub fn rollup_options(&self) -> RollupOptions {
        RollupOptions {
            top_n: self.top_n,
            day_bucket: self.day_bucket,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub log_directory: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_directory: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load configuration from environment, file, and defaults
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like [`Config::load`], with an explicit file taking precedence over the search path.
    pub fn load_with(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        let config_paths = [
            PathBuf::from("convo-usage.toml"),
            PathBuf::from(".convo-usage.toml"),
            dirs::config_dir()
                .map(|d| d.join("convo-usage").join("config.toml"))
                .unwrap_or_default(),
        ];

        if let Some(path) = explicit {
            info!(config_file = %path.display(), "Loading configuration from file");
            config = Self::load_from_file(path)?;
        } else {
            for path in config_paths.iter().filter(|p| !p.as_os_str().is_empty()) {
                if path.exists() {
                    info!(config_file = %path.display(), "Loading configuration from file");
                    config = Self::load_from_file(path)?;
                    break;
                }
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML file
    #[cfg(feature = "basic")]
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    #[cfg(not(feature = "basic"))]
    pub fn load_from_file(path: &Path) -> Result<Self> {
        anyhow::bail!(
            "Config file {} ignored: built without the `basic` feature",
            path.display()
        )
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        if let Ok(val) = env::var("CONVO_USAGE_MODE") {
            self.analysis.mode = val.parse().context("Invalid CONVO_USAGE_MODE")?;
        }
        if let Ok(val) = env::var("CONVO_USAGE_THOUGHT_MULTIPLIER") {
            self.analysis.thought_multiplier = val
                .parse()
                .context("Invalid CONVO_USAGE_THOUGHT_MULTIPLIER")?;
        }
        if let Ok(val) = env::var("CONVO_USAGE_SIMPLE_MODEL") {
            self.analysis.simple_model = val;
        }
        if let Ok(val) = env::var("CONVO_USAGE_DEFAULT_MODEL") {
            self.pricing.default_model = val;
        }

        if let Ok(val) = env::var("CONVO_USAGE_REPORT_DIR") {
            self.report.directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CONVO_USAGE_LOG_DIR") {
            self.paths.log_directory = PathBuf::from(val);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let analysis = &self.analysis;
        if !(analysis.thought_multiplier >= 0.0) {
            return Err(anyhow::anyhow!(
                "Thought multiplier must be non-negative, got {}",
                analysis.thought_multiplier
            ));
        }
        if !(0.0..=1.0).contains(&analysis.context_discount) {
            return Err(anyhow::anyhow!(
                "Context discount must be between 0 and 1, got {}",
                analysis.context_discount
            ));
        }

        self.pricing.validate()?;
        if self.pricing.get(&self.pricing.default_model).is_none() {
            warn!(
                default_model = %self.pricing.default_model,
                "Default pricing model has no rate, unknown models will use the last-resort rate"
            );
        }

        if self.report.top_n == 0 {
            return Err(anyhow::anyhow!("report.top_n must be greater than 0"));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => return Err(anyhow::anyhow!("Unknown log format: {}", other)),
        }
        match self.logging.output.as_str() {
            "console" | "file" | "both" => {}
            other => return Err(anyhow::anyhow!("Unknown log output: {}", other)),
        }

        Ok(())
    }

    /// Save current configuration to file
    #[cfg(feature = "basic")]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");

        Ok(())
    }
}

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the process-wide configuration. Returns the already-installed one
/// if called twice.
pub fn init_config(config: Config) -> &'static Config {
    CONFIG.get_or_init(|| config)
}

/// Get the global configuration instance, loading it on first use.
/// Falls back to defaults if loading fails.
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load configuration, using defaults");
            Config::default()
        })
    })
}
