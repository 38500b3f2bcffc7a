//! Dataset rollup
//!
//! Folds per-conversation [`AnalysisResult`]s into one [`DatasetSummary`]:
//! totals, per-model and per-day breakdowns, and the busiest conversations.
//! Summaries [`merge`](DatasetSummary::merge) in any order, so a parallel
//! fan-out can reduce however it likes.

use crate::models::{AnalysisResult, ModelId, ModelUsage, TokenTotals};
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Calendar used to bucket conversations by creation day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayBucket {
    #[default]
    Local,
    Utc,
}

impl DayBucket {
    /// Calendar day of an epoch-seconds timestamp.
    pub fn date_of(self, timestamp: f64) -> Option<NaiveDate> {
        let utc = utc_from_epoch(timestamp)?;
        Some(match self {
            DayBucket::Utc => utc.date_naive(),
            DayBucket::Local => utc.with_timezone(&Local).date_naive(),
        })
    }
}

impl FromStr for DayBucket {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(DayBucket::Local),
            "utc" => Ok(DayBucket::Utc),
            other => anyhow::bail!("Unknown day bucket: {} (expected local or utc)", other),
        }
    }
}

pub(crate) fn utc_from_epoch(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    Utc.timestamp_opt(secs as i64, nanos).single()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupOptions {
    pub top_n: usize,
    pub day_bucket: DayBucket,
}

impl Default for RollupOptions {
    fn default() -> Self {
        Self {
            top_n: 10,
            day_bucket: DayBucket::Local,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyStats {
    pub conversations: usize,
    pub messages: usize,
    pub real_turns: usize,
    pub tokens: TokenTotals,
    pub cost: Decimal,
}

impl DailyStats {
    pub fn merge(&mut self, other: &DailyStats) {
        self.conversations += other.conversations;
        self.messages += other.messages;
        self.real_turns += other.real_turns;
        self.tokens.add(&other.tokens);
        self.cost += other.cost;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopConversation {
    pub conversation_id: String,
    pub title: String,
    pub real_turns: usize,
    pub message_count: usize,
    pub total_cost: Decimal,
}

impl TopConversation {
    /// Most real turns first, then most messages, then id.
    fn rank(a: &Self, b: &Self) -> Ordering {
        b.real_turns
            .cmp(&a.real_turns)
            .then_with(|| b.message_count.cmp(&a.message_count))
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub conversations: usize,
    pub messages: usize,
    pub real_turns: usize,
    pub assistant_messages: usize,
    pub tokens: TokenTotals,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
    #[serde(serialize_with = "crate::models::serialize_model_breakdown")]
    pub per_model: BTreeMap<ModelId, ModelUsage>,
    pub per_day: BTreeMap<NaiveDate, DailyStats>,
    pub undated: usize,
    pub top_conversations: Vec<TopConversation>,
    pub approximate_tokens: usize,
    pub approximate_cost: usize,
    #[serde(skip)]
    top_n: usize,
}

impl DatasetSummary {
    /// Summary of a single conversation.
    pub fn from_result(result: &AnalysisResult, options: &RollupOptions) -> Self {
        let mut summary = Self {
            conversations: 1,
            messages: result.message_count,
            real_turns: result.real_turns,
            assistant_messages: result.assistant_messages,
            tokens: result.tokens,
            input_cost: result.input_cost,
            output_cost: result.output_cost,
            total_cost: result.total_cost,
            per_model: result.models.clone(),
            approximate_tokens: usize::from(result.tokens_approximate),
            approximate_cost: usize::from(result.cost_approximate),
            top_n: options.top_n,
            ..Default::default()
        };

        match result.create_time.and_then(|t| options.day_bucket.date_of(t)) {
            Some(day) => {
                summary.per_day.insert(
                    day,
                    DailyStats {
                        conversations: 1,
                        messages: result.message_count,
                        real_turns: result.real_turns,
                        tokens: result.tokens,
                        cost: result.total_cost,
                    },
                );
            }
            None => summary.undated = 1,
        }

        if options.top_n > 0 {
            summary.top_conversations.push(TopConversation {
                conversation_id: result.conversation_id.clone(),
                title: result.title.clone(),
                real_turns: result.real_turns,
                message_count: result.message_count,
                total_cost: result.total_cost,
            });
        }

        summary
    }

    pub fn merge(&mut self, other: DatasetSummary) {
        self.conversations += other.conversations;
        self.messages += other.messages;
        self.real_turns += other.real_turns;
        self.assistant_messages += other.assistant_messages;
        self.tokens.add(&other.tokens);
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.total_cost += other.total_cost;
        self.undated += other.undated;
        self.approximate_tokens += other.approximate_tokens;
        self.approximate_cost += other.approximate_cost;

        for (model, usage) in other.per_model {
            self.per_model.entry(model).or_default().merge(&usage);
        }
        for (day, stats) in other.per_day {
            self.per_day.entry(day).or_default().merge(&stats);
        }

        self.top_n = self.top_n.max(other.top_n);
        self.top_conversations.extend(other.top_conversations);
        self.top_conversations.sort_by(TopConversation::rank);
        self.top_conversations.truncate(self.top_n);
    }

    pub fn is_empty(&self) -> bool {
        self.conversations == 0
    }
}

/// Rolls up every result. Empty input gives a zero-valued summary.
pub fn rollup(results: &[AnalysisResult], options: &RollupOptions) -> DatasetSummary {
    let mut summary = DatasetSummary {
        top_n: options.top_n,
        ..Default::default()
    };
    for result in results {
        summary.merge(DatasetSummary::from_result(result, options));
    }
    summary
}
