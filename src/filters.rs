//! Conversation filters and lookups
//!
//! Date and model filters narrow the dataset before analysis; title and date
//! lookups search analysis results.

use crate::models::{AnalysisResult, Conversation, ModelId, Role};
use crate::rollup::DayBucket;
use chrono::NaiveDate;

/// Whether `model` answers to `query` as typed by a user. `"N/A"` matches the
/// unspecified sentinel as well as a literal `"N/A"` slug.
pub fn model_matches(model: &ModelId, query: &str) -> bool {
    model.to_string() == query
}

fn in_range(create_time: Option<f64>, since: Option<NaiveDate>, until: Option<NaiveDate>, bucket: DayBucket) -> bool {
    if since.is_none() && until.is_none() {
        return true;
    }
    let Some(day) = create_time.and_then(|t| bucket.date_of(t)) else {
        return false;
    };
    since.map_or(true, |s| day >= s) && until.map_or(true, |u| day <= u)
}

/// Keep conversations created within `[since, until]` (inclusive days).
/// Undated conversations are dropped once either bound is set.
pub fn filter_by_date(
    conversations: Vec<Conversation>,
    since: Option<NaiveDate>,
    until: Option<NaiveDate>,
    bucket: DayBucket,
) -> Vec<Conversation> {
    conversations
        .into_iter()
        .filter(|c| in_range(c.create_time, since, until, bucket))
        .collect()
}

/// Keep conversations with at least one assistant message from `model`.
pub fn filter_by_model(conversations: Vec<Conversation>, model: &str) -> Vec<Conversation> {
    conversations
        .into_iter()
        .filter(|conversation| {
            conversation
                .mapping
                .values()
                .filter_map(|node| node.message.as_ref())
                .filter(|message| message.role() == Role::Assistant)
                .any(|message| model_matches(&ModelId::from_slug(message.metadata.model_slug.as_deref()), model))
        })
        .collect()
}

/// Results whose title contains `query`.
pub fn find_by_title<'a>(results: &'a [AnalysisResult], query: &str, case_sensitive: bool) -> Vec<&'a AnalysisResult> {
    if case_sensitive {
        results.iter().filter(|r| r.title.contains(query)).collect()
    } else {
        let query = query.to_lowercase();
        results
            .iter()
            .filter(|r| r.title.to_lowercase().contains(&query))
            .collect()
    }
}

/// Results created on `date`.
pub fn find_by_date(results: &[AnalysisResult], date: NaiveDate, bucket: DayBucket) -> Vec<&AnalysisResult> {
    results
        .iter()
        .filter(|r| in_range(r.create_time, Some(date), Some(date), bucket))
        .collect()
}
