//! Core Data Models
//!
//! This module defines the data structures that flow through the conversation
//! analysis pipeline, from the raw export records to the per-conversation
//! results consumed by reporting.
//!
//! ## Data Flow
//!
//! 1. **Raw Data**: [`Conversation`] - one exported chat session with its message mapping
//! 2. **Reconstruction**: [`MessageNode`] / [`Message`] - tree entries ordered by [`crate::ordering`]
//! 3. **Classification**: [`Turn`] - one counted step of the linear sequence
//! 4. **Output**: [`AnalysisResult`] - token and cost totals for one conversation
//!
//! ## Features
//!
//! - **Lenient deserialization**: nulls, unknown roles and unknown content types
//!   never fail a conversation
//! - **Tagged content**: [`Content`] makes every content kind an exhaustive case
//! - **Sentinel models**: [`ModelId::Unspecified`] keeps "no model slug" distinct
//!   from an empty or real slug

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Display form of [`ModelId::Unspecified`].
pub const MODEL_SENTINEL: &str = "N/A";

/// Well-known id of the synthetic root node in chat exports.
pub const CLIENT_ROOT_ID: &str = "client-created-root";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub create_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub current_node: Option<String>,
    /// Entries that are not node objects are dropped.
    #[serde(default, deserialize_with = "lenient_mapping")]
    pub mapping: HashMap<String, MessageNode>,
}

impl Conversation {
    /// Export id, falling back to `conversation_id` and then to an empty string.
    pub fn id(&self) -> &str {
        self.id
            .as_deref()
            .or(self.conversation_id.as_deref())
            .unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageNode {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_message")]
    pub message: Option<Message>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub parent: Option<String>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub children: Vec<String>,
}

/// Every field reads a mistyped value as absent, so one bad field never
/// costs the whole conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub author: Author,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub create_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_time: Option<f64>,
    #[serde(default)]
    pub content: Content,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub end_turn: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub recipient: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub metadata: Metadata,
}

impl Message {
    /// Message-level `end_turn`, falling back to the metadata copy.
    pub fn ends_turn(&self) -> bool {
        self.end_turn.or(self.metadata.end_turn).unwrap_or(false)
    }

    pub fn role(&self) -> Role {
        self.author.role
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, deserialize_with = "lenient")]
    pub role: Role,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Structural roles never produce a real turn.
    pub fn is_structural(self) -> bool {
        matches!(self, Role::System)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, deserialize_with = "lenient_string")]
    pub model_slug: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub default_model_slug: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub end_turn: Option<bool>,
}

/// Message content, one variant per content kind found in exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    #[default]
    Empty,
    Text { parts: Vec<ContentPart> },
    Thoughts { thoughts: Vec<Thought> },
    UserContext {
        profile: Option<String>,
        instructions: Option<String>,
    },
    Code { content_type: String, text: String },
    ReasoningRecap { text: String },
    Unsupported { content_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContentPart {
    Text(String),
    Attachment { content_type: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Thought {
    pub summary: String,
    pub content: String,
}

impl Content {
    /// Interpret a raw `content` value; unknown shapes become [`Content::Unsupported`].
    pub fn from_value(value: Value) -> Self {
        let mut obj = match value {
            Value::Null => return Content::Empty,
            Value::String(text) => {
                return Content::Text {
                    parts: vec![ContentPart::Text(text)],
                }
            }
            Value::Array(items) => {
                return Content::Text {
                    parts: items.into_iter().filter_map(ContentPart::from_value).collect(),
                }
            }
            Value::Object(obj) => obj,
            other => {
                return Content::Unsupported {
                    content_type: json_kind(&other).to_string(),
                }
            }
        };

        let content_type = obj
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let text_field = |obj: &serde_json::Map<String, Value>, key: &str| {
            obj.get(key).and_then(Value::as_str).map(str::to_string)
        };

        match content_type.as_str() {
            "text" | "multimodal_text" => {
                let parts = match obj.remove("parts") {
                    Some(Value::Array(items)) => {
                        items.into_iter().filter_map(ContentPart::from_value).collect()
                    }
                    _ => Vec::new(),
                };
                Content::Text { parts }
            }
            "thoughts" => {
                let thoughts = match obj.remove("thoughts") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|t| Thought {
                            summary: t.get("summary").and_then(Value::as_str).unwrap_or("").to_string(),
                            content: t.get("content").and_then(Value::as_str).unwrap_or("").to_string(),
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                Content::Thoughts { thoughts }
            }
            "user_editable_context" => Content::UserContext {
                profile: text_field(&obj, "user_profile"),
                instructions: text_field(&obj, "user_instructions"),
            },
            "code" | "execution_output" | "tether_quote" | "system_error" => Content::Code {
                text: text_field(&obj, "text").unwrap_or_default(),
                content_type: content_type.clone(),
            },
            "reasoning_recap" => Content::ReasoningRecap {
                text: text_field(&obj, "content").unwrap_or_default(),
            },
            "" if obj.is_empty() => Content::Empty,
            "" => Content::Unsupported {
                content_type: "unknown".to_string(),
            },
            other => Content::Unsupported {
                content_type: other.to_string(),
            },
        }
    }

    /// Content type label used in inspection reports.
    pub fn kind(&self) -> &str {
        match self {
            Content::Empty => "empty",
            Content::Text { .. } => "text",
            Content::Thoughts { .. } => "thoughts",
            Content::UserContext { .. } => "user_editable_context",
            Content::Code { content_type, .. } => content_type,
            Content::ReasoningRecap { .. } => "reasoning_recap",
            Content::Unsupported { content_type } => content_type,
        }
    }

    /// Human-readable text, used for transcripts and samples.
    pub fn display_text(&self) -> String {
        match self {
            Content::Empty => String::new(),
            Content::Text { parts } => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => text.clone(),
                    ContentPart::Attachment { content_type } => format!("[{}]", content_type),
                })
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Content::Thoughts { thoughts } => thoughts
                .iter()
                .map(|t| format!("[Thought: {}] {}", t.summary, t.content))
                .collect::<Vec<_>>()
                .join("\n"),
            Content::UserContext { profile, instructions } => {
                let mut out = Vec::new();
                if let Some(profile) = profile.as_deref().filter(|s| !s.is_empty()) {
                    out.push(format!("[User Profile]: {}", profile));
                }
                if let Some(instructions) = instructions.as_deref().filter(|s| !s.is_empty()) {
                    out.push(format!("[User Instructions]: {}", instructions));
                }
                out.join("\n")
            }
            Content::Code { text, .. } | Content::ReasoningRecap { text } => text.clone(),
            Content::Unsupported { content_type } => format!("[unsupported content: {}]", content_type),
        }
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Content::from_value)
    }
}

impl ContentPart {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(text) => Some(ContentPart::Text(text)),
            Value::Object(obj) => {
                // Some exports wrap plain text in {"text": ...}
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    if obj.get("content_type").is_none() {
                        return Some(ContentPart::Text(text.to_string()));
                    }
                }
                let content_type = obj
                    .get("content_type")
                    .and_then(Value::as_str)
                    .unwrap_or("object")
                    .to_string();
                Some(ContentPart::Attachment { content_type })
            }
            other => Some(ContentPart::Attachment {
                content_type: json_kind(&other).to_string(),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolved model of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelId {
    Named(String),
    /// No model slug present on the message; displayed as `"N/A"`.
    Unspecified,
}

impl ModelId {
    pub fn from_slug(slug: Option<&str>) -> Self {
        match slug {
            Some(slug) => ModelId::Named(slug.to_string()),
            None => ModelId::Unspecified,
        }
    }

    pub fn slug(&self) -> Option<&str> {
        match self {
            ModelId::Named(slug) => Some(slug),
            ModelId::Unspecified => None,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, ModelId::Unspecified)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelId::Named(slug) => f.write_str(slug),
            ModelId::Unspecified => f.write_str(MODEL_SENTINEL),
        }
    }
}

impl Serialize for ModelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Serialize)]
struct ModelEntry<'a> {
    model: &'a ModelId,
    /// True for the no-slug sentinel, false for a named slug (even one spelled "N/A").
    unspecified: bool,
    #[serde(flatten)]
    usage: &'a ModelUsage,
}

/// Per-model breakdowns serialize as a list of entries rather than a map, so
/// the sentinel and a literal `"N/A"` slug never share a key.
pub(crate) fn serialize_model_breakdown<S>(models: &BTreeMap<ModelId, ModelUsage>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(models.len()))?;
    for (model, usage) in models {
        seq.serialize_element(&ModelEntry {
            model,
            unspecified: model.is_unspecified(),
            usage,
        })?;
    }
    seq.end()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Detailed,
    Simple,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "detailed" => Ok(Mode::Detailed),
            "simple" => Ok(Mode::Simple),
            other => anyhow::bail!("Unknown calculation mode: {} (expected detailed or simple)", other),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Detailed => f.write_str("detailed"),
            Mode::Simple => f.write_str("simple"),
        }
    }
}

/// How a pricing rate was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    #[default]
    Exact,
    DefaultModel,
    LastResort,
}

impl RateSource {
    pub fn is_approximate(self) -> bool {
        !matches!(self, RateSource::Exact)
    }
}

/// Non-fatal data-quality notes attached to turns and results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    CycleDetected { node_id: String },
    /// Node already emitted from another root or branch; not a cycle.
    RevisitedNode { node_id: String },
    DanglingChild { parent_id: String, child_id: String },
    SyntheticRoot { node_id: String },
    NonTextPart { node_id: String, content_type: String, tokens: u64 },
    UnsupportedContent { node_id: String, content_type: String, tokens: u64 },
    ApproximateTokens { model: String },
    PriceFallback { model: String, source: RateSource, rate_model: Option<String> },
}

impl Annotation {
    pub fn is_warning(&self) -> bool {
        !matches!(self, Annotation::NonTextPart { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    /// Reasoning content, billed as scaled output.
    Thought,
    /// Reasoning label, billed as plain output.
    ThoughtSummary,
    Context,
    Code,
    Attachment,
    Recap,
    Unsupported,
}

impl PartKind {
    /// Reasoning parts never become context for later turns.
    pub fn is_reasoning(self) -> bool {
        matches!(self, PartKind::Thought | PartKind::ThoughtSummary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountedPart {
    pub kind: PartKind,
    pub tokens: u64,
}

/// One step of the reconstructed linear sequence.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub node_id: String,
    pub role: Role,
    pub model: ModelId,
    pub create_time: Option<f64>,
    pub parts: Vec<CountedPart>,
    pub is_real_turn: bool,
    /// Number of real turns completed before this message.
    pub exchange: usize,
    pub approximate: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl Turn {
    /// Tokens of everything except reasoning; this is what later turns see as context.
    pub fn visible_tokens(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| !p.kind.is_reasoning())
            .map(|p| p.tokens)
            .sum()
    }

    pub fn thought_tokens(&self) -> u64 {
        self.tokens_of(PartKind::Thought)
    }

    pub fn thought_summary_tokens(&self) -> u64 {
        self.tokens_of(PartKind::ThoughtSummary)
    }

    fn tokens_of(&self, kind: PartKind) -> u64 {
        self.parts.iter().filter(|p| p.kind == kind).map(|p| p.tokens).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub thought: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.thought
    }

    pub fn add(&mut self, other: &TokenTotals) {
        self.input += other.input;
        self.output += other.output;
        self.thought += other.thought;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub messages: usize,
    pub tokens: TokenTotals,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cost: Decimal,
    pub rate_source: RateSource,
}

impl ModelUsage {
    pub fn merge(&mut self, other: &ModelUsage) {
        self.messages += other.messages;
        self.tokens.add(&other.tokens);
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.cost += other.cost;
        self.rate_source = self.rate_source.max(other.rate_source);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleTokens {
    pub user: u64,
    pub assistant: u64,
    pub system: u64,
    pub thought: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetail {
    pub node_id: String,
    pub role: Role,
    pub model: ModelId,
    pub exchange: usize,
    pub is_real_turn: bool,
    /// Whether this turn contributes to the conversation's cost totals.
    pub counted: bool,
    /// Visible tokens of the message itself.
    pub content_tokens: u64,
    /// Tokens billed for this turn (zero unless counted).
    pub tokens: TokenTotals,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cost: Decimal,
    pub context_discounted: bool,
    pub approximate: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

/// Token and cost totals for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub conversation_id: String,
    pub title: String,
    pub create_time: Option<f64>,
    pub update_time: Option<f64>,
    pub mode: Mode,
    pub message_count: usize,
    pub real_turns: usize,
    pub assistant_messages: usize,
    pub tokens: TokenTotals,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
    #[serde(serialize_with = "serialize_model_breakdown")]
    pub models: BTreeMap<ModelId, ModelUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_tokens: Option<RoleTokens>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<TurnDetail>,
    pub tokens_approximate: bool,
    pub cost_approximate: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl AnalysisResult {
    pub fn is_approximate(&self) -> bool {
        self.tokens_approximate || self.cost_approximate
    }

    /// Sum of per-model subtotals; equals `total_cost` by construction.
    pub fn model_cost_sum(&self) -> Decimal {
        self.models.values().map(|m| m.cost).sum()
    }
}

/// Any value that does not deserialize as `T` (including null) reads as the default.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        _ => None,
    })
}

/// String entries of an array; other entries are dropped.
fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// A payload that is not an object reads as no payload.
fn lenient_message<'de, D>(deserializer: D) -> Result<Option<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

fn lenient_mapping<'de, D>(deserializer: D) -> Result<HashMap<String, MessageNode>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(entries) => entries
            .into_iter()
            .filter(|(_, node)| node.is_object())
            .filter_map(|(id, node)| serde_json::from_value(node).ok().map(|node| (id, node)))
            .collect(),
        _ => HashMap::new(),
    })
}

/// Accepts numbers and numeric strings; anything else reads as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}
