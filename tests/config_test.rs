use std::env;
use std::fs;
use std::sync::Mutex;
use tempfile::tempdir;

/// Tests that read or write process environment run one at a time.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod config_tests {
    use super::*;
    use convo_usage::config::Config;
    use convo_usage::ordering::BranchPolicy;
    use convo_usage::report::ReportFormat;
    use convo_usage::rollup::DayBucket;
    use convo_usage::tokenizer::Encoding;
    use convo_usage::{Analyzer, Mode};

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        // Logging defaults
        assert_eq!(config.logging.level, "WARN");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "console");

        // Analysis defaults
        assert_eq!(config.analysis.mode, Mode::Detailed);
        assert_eq!(config.analysis.thought_multiplier, 1.2);
        assert_eq!(config.analysis.context_discount, 0.5);
        assert_eq!(config.analysis.simple_model, "o3");
        assert_eq!(config.analysis.branch_policy, BranchPolicy::LatestTimestamp);
        assert!(config.analysis.follow_current_node);
        assert!(!config.analysis.include_incomplete_turns);

        // Tokenizer and pricing defaults
        assert_eq!(config.tokenizer.default_encoding, Encoding::Cl100kBase);
        assert_eq!(config.pricing.default_model, "o3");
        assert_eq!(config.pricing.get("gpt-4o").unwrap().input_per_million, 2.5);
        assert_eq!(config.pricing.get("o1-pro").unwrap().output_per_million, 600.0);

        // Report defaults
        assert_eq!(config.report.format, ReportFormat::Text);
        assert_eq!(config.report.top_n, 10);
        assert_eq!(config.report.day_bucket, DayBucket::Local);
    }

    #[test]
    fn test_env_variable_override() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("CONVO_USAGE_MODE", "simple");
        env::set_var("CONVO_USAGE_THOUGHT_MULTIPLIER", "2.0");
        env::set_var("CONVO_USAGE_DEFAULT_MODEL", "gpt-4o");

        let mut config = Config::default();
        config
            .apply_env_overrides()
            .expect("Failed to apply env overrides");

        assert_eq!(config.analysis.mode, Mode::Simple);
        assert_eq!(config.analysis.thought_multiplier, 2.0);
        assert_eq!(config.pricing.default_model, "gpt-4o");

        env::set_var("CONVO_USAGE_MODE", "turbo");
        assert!(Config::default().apply_env_overrides().is_err());

        env::remove_var("CONVO_USAGE_MODE");
        env::remove_var("CONVO_USAGE_THOUGHT_MULTIPLIER");
        env::remove_var("CONVO_USAGE_DEFAULT_MODEL");
    }

    #[test]
    fn test_load_explicit_file() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
            [analysis]
            context_discount = 1.0
            include_incomplete_turns = true

            [tokenizer.model_encodings]
            house-model = "o200k_base"

            [pricing]
            default_model = "house-model"

            [pricing.models.house-model]
            input_per_million = 1.0
            output_per_million = 2.0
            "#,
        )
        .unwrap();

        let config = Config::load_with(Some(&path)).unwrap();
        assert_eq!(config.analysis.context_discount, 1.0);
        assert!(config.analysis.include_incomplete_turns);
        assert_eq!(config.tokenizer.model_encodings["house-model"], Encoding::O200kBase);
        assert!(config.pricing.get("gpt-4o").is_none(), "a models table replaces the built-ins");

        let analyzer = Analyzer::from_config(&config);
        assert_eq!(analyzer.pricing().default_model, "house-model");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[analysis]\ncontext_discount = 3.0\n").unwrap();
        let err = Config::load_with(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Context discount"));

        fs::write(&path, "[analysis]\nbranch_policy = \"random\"\n").unwrap();
        assert!(Config::load_with(Some(&path)).is_err());

        assert!(Config::load_with(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_round_trip_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        Config::default().save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.pricing, Config::default().pricing);
        assert_eq!(loaded.report.top_n, 10);
    }
}
