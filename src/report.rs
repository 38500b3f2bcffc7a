//! Output Formatting and Report Generation
//!
//! Renders analysis results for people and for programs:
//!
//! - **Text**: colored terminal summary (`colored`)
//! - **JSON**: the full [`Report`] document
//! - **CSV**: one row per conversation
//!
//! Reports can be written to the configured directory as
//! `report_<timestamp>.<ext>`. Costs are kept exact until they are printed
//! here.

use crate::inspect::{ModelDetails, TranscriptEntry};
use crate::models::{AnalysisResult, Mode};
use crate::rollup::{utc_from_epoch, DatasetSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use colored::Colorize;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => anyhow::bail!("Unknown report format: {} (expected text, json or csv)", other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub mode: Mode,
    pub filters: ReportFilters,
    pub total_conversations: usize,
    /// Set when the run was interrupted and results are partial.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: DatasetSummary,
    pub conversations: Vec<AnalysisResult>,
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    conversation_id: &'a str,
    title: &'a str,
    created: String,
    mode: Mode,
    messages: usize,
    real_turns: usize,
    assistant_messages: usize,
    input_tokens: u64,
    output_tokens: u64,
    thought_tokens: u64,
    input_cost: String,
    output_cost: String,
    total_cost: String,
    models: String,
    tokens_approximate: bool,
    cost_approximate: bool,
}

impl Report {
    pub fn render(&self, format: ReportFormat, json_pretty: bool, verbose: bool) -> Result<String> {
        match format {
            ReportFormat::Text => Ok(self.to_text(verbose)),
            ReportFormat::Json => self.to_json(json_pretty),
            ReportFormat::Csv => self.to_csv(),
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        json.context("Failed to serialize report to JSON")
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for result in &self.conversations {
            writer
                .serialize(CsvRow {
                    conversation_id: &result.conversation_id,
                    title: &result.title,
                    created: result.create_time.map(format_timestamp).unwrap_or_default(),
                    mode: result.mode,
                    messages: result.message_count,
                    real_turns: result.real_turns,
                    assistant_messages: result.assistant_messages,
                    input_tokens: result.tokens.input,
                    output_tokens: result.tokens.output,
                    thought_tokens: result.tokens.thought,
                    input_cost: result.input_cost.normalize().to_string(),
                    output_cost: result.output_cost.normalize().to_string(),
                    total_cost: result.total_cost.normalize().to_string(),
                    models: result.models.keys().map(|m| m.to_string()).collect::<Vec<_>>().join(";"),
                    tokens_approximate: result.tokens_approximate,
                    cost_approximate: result.cost_approximate,
                })
                .context("Failed to write CSV row")?;
        }
        let bytes = writer.into_inner().context("Failed to flush CSV output")?;
        String::from_utf8(bytes).context("CSV output is not UTF-8")
    }

    pub fn to_text(&self, verbose: bool) -> String {
        let mut out = String::new();
        let summary = &self.summary;

        banner(
            &mut out,
            &format!("Conversation Usage Report ({} mode)", self.metadata.mode),
        );
        if self.metadata.cancelled {
            let _ = writeln!(out, "{}", "Interrupted: results are partial".bright_red().bold());
        }

        write_totals(&mut out, summary);

        if !summary.per_model.is_empty() {
            let _ = writeln!(out, "\n{}", "Models".bright_white().bold());
            for (model, usage) in &summary.per_model {
                let share = percent(usage.cost, summary.total_cost);
                let _ = writeln!(
                    out,
                    "   {}: {} ({}%, {} messages, {} tokens){}",
                    model.to_string().bright_cyan(),
                    money(usage.cost).bright_green(),
                    format!("{:.0}", share).bright_yellow(),
                    usage.messages,
                    usage.tokens.total(),
                    if usage.rate_source.is_approximate() {
                        format!(" [{:?} rate]", usage.rate_source).yellow().to_string()
                    } else {
                        String::new()
                    }
                );
            }
        }

        if !summary.top_conversations.is_empty() {
            let _ = writeln!(out, "\n{}", "Top conversations by turns".bright_white().bold());
            for (rank, top) in summary.top_conversations.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "   {}. {} ({} turns, {} messages, {})",
                    rank + 1,
                    display_title(&top.title).bright_white(),
                    top.real_turns,
                    top.message_count,
                    money(top.total_cost).bright_green()
                );
            }
        }

        if verbose {
            let _ = writeln!(out, "\n{}", "Conversations".bright_white().bold());
            for result in &self.conversations {
                write_conversation(&mut out, result);
            }
        }

        out
    }

    /// Write the report to `directory` and return the file path.
    pub fn save(&self, directory: &Path, format: ReportFormat, json_pretty: bool, verbose: bool) -> Result<PathBuf> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create report directory: {}", directory.display()))?;

        let name = format!(
            "report_{}.{}",
            self.metadata.generated_at.format("%Y%m%d_%H%M%S"),
            format.extension()
        );
        let path = directory.join(name);

        let mut body = self.render(format, json_pretty, verbose)?;
        if format == ReportFormat::Text {
            body = strip_ansi(&body);
        }
        std::fs::write(&path, body).with_context(|| format!("Failed to write report: {}", path.display()))?;

        info!(path = %path.display(), ?format, "Report saved");
        Ok(path)
    }
}

fn banner(out: &mut String, title: &str) {
    let _ = writeln!(out, "{}", "=".repeat(80).bright_cyan());
    let _ = writeln!(out, "{}", title.bright_white().bold());
    let _ = writeln!(out, "{}", "=".repeat(80).bright_cyan());
}

fn write_totals(out: &mut String, summary: &DatasetSummary) {
    let _ = writeln!(
        out,
        "\n{} conversations • {} messages • {} real turns • {} total",
        summary.conversations.to_string().bright_white().bold(),
        summary.messages.to_string().bright_white().bold(),
        summary.real_turns.to_string().bright_white().bold(),
        money(summary.total_cost).bright_green().bold()
    );
    let _ = writeln!(
        out,
        "Tokens: {} input • {} output • {} thought",
        summary.tokens.input, summary.tokens.output, summary.tokens.thought
    );
    let _ = writeln!(
        out,
        "Cost: {} input • {} output",
        money(summary.input_cost),
        money(summary.output_cost)
    );
    if summary.approximate_tokens > 0 || summary.approximate_cost > 0 {
        let _ = writeln!(
            out,
            "{}",
            format!(
                "Approximate: {} conversations with estimated tokens, {} with fallback pricing",
                summary.approximate_tokens, summary.approximate_cost
            )
            .yellow()
        );
    }
}

fn write_conversation(out: &mut String, result: &AnalysisResult) {
    let _ = writeln!(
        out,
        "   {} [{}] {} turns, {} messages, {} tokens, {}{}",
        display_title(&result.title).bright_white(),
        result.conversation_id.dimmed(),
        result.real_turns,
        result.message_count,
        result.tokens.total(),
        money(result.total_cost).bright_green(),
        if result.is_approximate() { " ~".yellow().to_string() } else { String::new() }
    );
}

/// Daily breakdown, most recent day first.
pub fn render_daily(summary: &DatasetSummary, limit: Option<usize>) -> String {
    let mut out = String::new();
    banner(&mut out, "Conversation Usage - Daily");
    write_totals(&mut out, summary);
    let _ = writeln!(out);

    let days = summary.per_day.iter().rev().take(limit.unwrap_or(usize::MAX));
    for (day, stats) in days {
        let _ = writeln!(
            out,
            "{}  {} ({} conversations, {} turns, {} tokens)",
            day.to_string().bright_white().bold(),
            money(stats.cost).bright_green().bold(),
            stats.conversations,
            stats.real_turns,
            stats.tokens.total()
        );
    }
    if summary.undated > 0 {
        let _ = writeln!(out, "{} conversations without a creation date", summary.undated);
    }
    out
}

pub fn render_top(summary: &DatasetSummary) -> String {
    let mut out = String::new();
    banner(&mut out, "Top Conversations by Turns");
    for (rank, top) in summary.top_conversations.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. {} [{}]\n     {} turns • {} messages • {}",
            rank + 1,
            display_title(&top.title).bright_white().bold(),
            top.conversation_id.dimmed(),
            top.real_turns,
            top.message_count,
            money(top.total_cost).bright_green()
        );
    }
    out
}

pub fn render_results(title: &str, results: &[&AnalysisResult]) -> String {
    let mut out = String::new();
    banner(&mut out, title);
    if results.is_empty() {
        let _ = writeln!(out, "No matching conversations");
    }
    for result in results {
        write_conversation(&mut out, result);
    }
    out
}

pub fn render_model_details(details: &ModelDetails) -> String {
    let mut out = String::new();
    banner(&mut out, &format!("Detailed Analysis for Model: {}", details.model));
    let _ = writeln!(
        out,
        "Total messages with model '{}': {} across {} conversations",
        details.model, details.messages, details.conversations
    );

    for (heading, counts) in [
        ("Message recipients", &details.recipients),
        ("Content types", &details.content_types),
        ("Author roles", &details.roles),
    ] {
        let _ = writeln!(out, "\n{}:", heading.bright_white().bold());
        let mut sorted: Vec<_> = counts.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (name, count) in sorted {
            let share = *count as f64 / details.messages.max(1) as f64 * 100.0;
            let _ = writeln!(out, "  - {}: {} messages ({:.1}%)", name.bright_cyan(), count, share);
        }
    }

    for (index, sample) in details.samples.iter().enumerate() {
        let _ = writeln!(out, "\nSample {}:", index + 1);
        let _ = writeln!(out, "  Conversation: {}", sample.conversation);
        let _ = writeln!(out, "  Author: {}", sample.role);
        let _ = writeln!(out, "  Recipient: {}", sample.recipient);
        let _ = writeln!(out, "  Content: {}", sample.text);
    }
    out
}

pub fn render_transcript(result: &AnalysisResult, entries: &[TranscriptEntry]) -> String {
    let mut out = String::new();
    banner(&mut out, display_title(&result.title));
    let _ = writeln!(
        out,
        "{} • {} messages • {} turns • {}",
        result.conversation_id.dimmed(),
        result.message_count,
        result.real_turns,
        money(result.total_cost).bright_green()
    );

    let mut exchange = None;
    for entry in entries {
        if exchange != Some(entry.exchange) {
            exchange = Some(entry.exchange);
            let _ = writeln!(out, "\n{}", format!("--- Exchange {} ---", entry.exchange + 1).bright_cyan());
        }
        let when = entry.create_time.map(format_timestamp).unwrap_or_default();
        let _ = writeln!(
            out,
            "[{}] {} ({}) {}",
            entry.role.to_string().bright_white().bold(),
            entry.model,
            entry.node_id.dimmed(),
            when.dimmed()
        );
        let _ = writeln!(out, "{}", entry.text);
    }
    out
}

fn display_title(title: &str) -> &str {
    if title.is_empty() {
        "Untitled"
    } else {
        title
    }
}

fn money(amount: Decimal) -> String {
    format!("${:.4}", amount)
}

fn percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        Decimal::ZERO
    } else {
        part / whole * Decimal::ONE_HUNDRED
    }
}

fn format_timestamp(timestamp: f64) -> String {
    utc_from_epoch(timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Remove terminal color codes for files.
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelId, ModelUsage};
    use crate::rollup::{rollup, DayBucket, RollupOptions};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn report() -> Report {
        let mut models = BTreeMap::new();
        models.insert(
            ModelId::Unspecified,
            ModelUsage {
                messages: 2,
                cost: Decimal::new(15, 4),
                ..Default::default()
            },
        );
        let results = vec![AnalysisResult {
            conversation_id: "c1".to_string(),
            title: "Trip, planning".to_string(),
            create_time: Some(1_704_067_200.0),
            message_count: 4,
            real_turns: 2,
            total_cost: Decimal::new(15, 4),
            output_cost: Decimal::new(15, 4),
            models,
            ..Default::default()
        }];
        let options = RollupOptions {
            top_n: 5,
            day_bucket: DayBucket::Utc,
        };
        Report {
            metadata: ReportMetadata {
                generated_at: Utc::now(),
                run_id: "run".to_string(),
                mode: Mode::Detailed,
                filters: ReportFilters::default(),
                total_conversations: 1,
                cancelled: false,
            },
            summary: rollup(&results, &options),
            conversations: results,
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert!("xml".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_csv_quotes_titles() {
        let csv = report().to_csv().unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("conversation_id,title,created"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("c1,\"Trip, planning\",2024-01-01 00:00:00,detailed,4,2"));
        assert!(row.contains("0.0015"));
        assert!(row.contains("N/A"));
    }

    #[test]
    fn test_json_has_metadata_and_summary() {
        let json: serde_json::Value = serde_json::from_str(&report().to_json(false).unwrap()).unwrap();
        assert_eq!(json["metadata"]["run_id"], "run");
        assert_eq!(json["metadata"]["mode"], "detailed");
        assert_eq!(json["summary"]["conversations"], 1);
        assert_eq!(json["summary"]["per_model"][0]["model"], "N/A");
        assert_eq!(json["summary"]["per_model"][0]["unspecified"], true);
    }

    #[test]
    fn test_text_report() {
        colored::control::set_override(false);
        let text = report().to_text(true);
        assert!(text.contains("Conversation Usage Report (detailed mode)"));
        assert!(text.contains("$0.0015"));
        assert!(text.contains("Trip, planning"));
    }

    #[test]
    fn test_save_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = report().save(dir.path(), ReportFormat::Json, true, false).unwrap();
        assert_eq!(path.extension().unwrap(), "json");
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("report_"));
        assert!(std::fs::read_to_string(path).unwrap().contains("\"run_id\""));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[1;32mgreen\u{1b}[0m plain"), "green plain");
    }
}
