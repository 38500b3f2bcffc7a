//! Conversation inspection
//!
//! Read-only views over ordered conversations: per-model message profiles,
//! the first model a conversation used, and readable transcripts.

use crate::filters::model_matches;
use crate::models::{Conversation, ModelId, Role};
use crate::ordering::{order_messages, OrderingOptions};
use serde::Serialize;
use std::collections::BTreeMap;

const MAX_SAMPLES: usize = 3;
const SAMPLE_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSample {
    pub conversation: String,
    pub role: Role,
    pub recipient: String,
    pub content_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelDetails {
    pub model: String,
    pub conversations: usize,
    pub messages: usize,
    pub recipients: BTreeMap<String, usize>,
    pub content_types: BTreeMap<String, usize>,
    pub roles: BTreeMap<String, usize>,
    pub samples: Vec<MessageSample>,
}

/// Profile of every ordered message whose model answers to `model`.
pub fn model_details(conversations: &[Conversation], model: &str, options: &OrderingOptions) -> ModelDetails {
    let mut details = ModelDetails {
        model: model.to_string(),
        ..Default::default()
    };

    for conversation in conversations {
        let ordered = order_messages(conversation, options);
        let mut seen = false;

        for entry in &ordered.nodes {
            let message = entry.message;
            let resolved = ModelId::from_slug(message.metadata.model_slug.as_deref());
            if !model_matches(&resolved, model) {
                continue;
            }
            seen = true;
            details.messages += 1;

            let recipient = message.recipient.as_deref().unwrap_or("none");
            *details.recipients.entry(recipient.to_string()).or_default() += 1;
            *details.content_types.entry(message.content.kind().to_string()).or_default() += 1;
            *details.roles.entry(message.role().to_string()).or_default() += 1;

            if details.samples.len() < MAX_SAMPLES {
                details.samples.push(MessageSample {
                    conversation: if conversation.title().is_empty() {
                        "Untitled".to_string()
                    } else {
                        conversation.title().to_string()
                    },
                    role: message.role(),
                    recipient: recipient.to_string(),
                    content_type: message.content.kind().to_string(),
                    text: truncate(&message.content.display_text(), SAMPLE_CHARS),
                });
            }
        }

        if seen {
            details.conversations += 1;
        }
    }

    details
}

/// First model slug on an assistant message, in conversation order.
pub fn first_model_used(conversation: &Conversation, options: &OrderingOptions) -> Option<String> {
    order_messages(conversation, options)
        .nodes
        .iter()
        .filter(|n| n.message.role() == Role::Assistant)
        .find_map(|n| n.message.metadata.model_slug.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub node_id: String,
    pub role: Role,
    pub model: ModelId,
    pub create_time: Option<f64>,
    /// Real turns completed before this message.
    pub exchange: usize,
    pub ends_exchange: bool,
    pub text: String,
}

pub fn transcript(conversation: &Conversation, options: &OrderingOptions) -> Vec<TranscriptEntry> {
    let mut exchange = 0;
    order_messages(conversation, options)
        .nodes
        .iter()
        .map(|entry| {
            let message = entry.message;
            let ends_exchange = message.ends_turn() && !message.role().is_structural();
            let item = TranscriptEntry {
                node_id: entry.id.to_string(),
                role: message.role(),
                model: ModelId::from_slug(message.metadata.model_slug.as_deref()),
                create_time: message.create_time,
                exchange,
                ends_exchange,
                text: message.content.display_text(),
            };
            if ends_exchange {
                exchange += 1;
            }
            item
        })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
