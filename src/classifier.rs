//! Turn classification and token counting
//!
//! Turns each ordered message into a [`Turn`]: resolved role and model,
//! content split into countable parts, and a token count per part. Content
//! kinds are dispatched exhaustively on [`Content`]; kinds without countable
//! text get a configured placeholder count and an annotation instead of
//! failing the conversation.

use crate::models::{Annotation, Content, ContentPart, CountedPart, ModelId, PartKind, Role, Turn};
use crate::ordering::OrderedMessages;
use crate::tokenizer::{TokenCount, Tokenizer};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierOptions {
    /// Tokens charged per image, audio or file part.
    pub non_text_part_tokens: u64,
    /// Tokens charged for content kinds the classifier does not understand.
    pub unsupported_part_tokens: u64,
}

/// A countable piece of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text { kind: PartKind, text: &'a str },
    Placeholder { kind: PartKind, content_type: &'a str },
}

impl Segment<'_> {
    pub fn kind(&self) -> PartKind {
        match self {
            Segment::Text { kind, .. } | Segment::Placeholder { kind, .. } => *kind,
        }
    }
}

/// Splits content into segments; empty strings are dropped.
pub fn segments(content: &Content) -> Vec<Segment<'_>> {
    fn push_text<'a>(out: &mut Vec<Segment<'a>>, kind: PartKind, text: &'a str) {
        if !text.is_empty() {
            out.push(Segment::Text { kind, text });
        }
    }

    let mut out = Vec::new();
    match content {
        Content::Empty => {}
        Content::Text { parts } => {
            for part in parts {
                match part {
                    ContentPart::Text(text) => push_text(&mut out, PartKind::Text, text),
                    ContentPart::Attachment { content_type } => out.push(Segment::Placeholder {
                        kind: PartKind::Attachment,
                        content_type,
                    }),
                }
            }
        }
        Content::Thoughts { thoughts } => {
            for thought in thoughts {
                push_text(&mut out, PartKind::ThoughtSummary, &thought.summary);
                push_text(&mut out, PartKind::Thought, &thought.content);
            }
        }
        Content::UserContext { profile, instructions } => {
            push_text(&mut out, PartKind::Context, profile.as_deref().unwrap_or(""));
            push_text(&mut out, PartKind::Context, instructions.as_deref().unwrap_or(""));
        }
        Content::Code { text, .. } => push_text(&mut out, PartKind::Code, text),
        Content::ReasoningRecap { .. } => out.push(Segment::Placeholder {
            kind: PartKind::Recap,
            content_type: "reasoning_recap",
        }),
        Content::Unsupported { content_type } => out.push(Segment::Placeholder {
            kind: PartKind::Unsupported,
            content_type,
        }),
    }
    out
}

/// Counts one segment. Placeholders get their configured count and an annotation.
fn count_segment(
    segment: &Segment<'_>,
    node_id: &str,
    model: &ModelId,
    tokenizer: &Tokenizer,
    options: &ClassifierOptions,
    annotations: &mut Vec<Annotation>,
) -> TokenCount {
    match *segment {
        Segment::Text { text, .. } => tokenizer.count(text, model),
        Segment::Placeholder { kind: PartKind::Attachment, content_type } => {
            annotations.push(Annotation::NonTextPart {
                node_id: node_id.to_string(),
                content_type: content_type.to_string(),
                tokens: options.non_text_part_tokens,
            });
            TokenCount {
                tokens: options.non_text_part_tokens,
                approximate: false,
            }
        }
        Segment::Placeholder { kind: PartKind::Recap, .. } => TokenCount::default(),
        Segment::Placeholder { content_type, .. } => {
            warn!(node_id, content_type, "Unsupported content type");
            annotations.push(Annotation::UnsupportedContent {
                node_id: node_id.to_string(),
                content_type: content_type.to_string(),
                tokens: options.unsupported_part_tokens,
            });
            TokenCount {
                tokens: options.unsupported_part_tokens,
                approximate: false,
            }
        }
    }
}

/// One [`Turn`] per ordered message, with per-part token counts.
pub fn classify_turns(ordered: &OrderedMessages<'_>, tokenizer: &Tokenizer, options: &ClassifierOptions) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(ordered.len());
    let mut exchange = 0;

    for entry in &ordered.nodes {
        let message = entry.message;
        let role = message.role();
        let model = ModelId::from_slug(message.metadata.model_slug.as_deref());

        let mut annotations = Vec::new();
        let mut approximate = false;
        let parts: Vec<CountedPart> = segments(&message.content)
            .iter()
            .map(|segment| {
                let count = count_segment(segment, entry.id, &model, tokenizer, options, &mut annotations);
                approximate |= count.approximate;
                CountedPart {
                    kind: segment.kind(),
                    tokens: count.tokens,
                }
            })
            .collect();

        let is_real_turn = message.ends_turn() && !role.is_structural();

        turns.push(Turn {
            node_id: entry.id.to_string(),
            role,
            model,
            create_time: message.create_time,
            parts,
            is_real_turn,
            exchange,
            approximate,
            annotations,
        });

        if is_real_turn {
            exchange += 1;
        }
    }

    turns
}

/// Text of one role, joined for a single count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pool {
    pub text: String,
    pub fixed_tokens: u64,
    pub messages: usize,
}

impl Pool {
    fn push_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }

    pub fn count(&self, tokenizer: &Tokenizer, model: &ModelId) -> TokenCount {
        let counted = tokenizer.count(&self.text, model);
        TokenCount {
            tokens: counted.tokens + self.fixed_tokens,
            approximate: counted.approximate,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RolePools {
    pub user: Pool,
    pub assistant: Pool,
    pub system: Pool,
    pub thought: Pool,
    pub annotations: Vec<Annotation>,
}

/// Pools content by role for simple mode. Thought content goes to its own
/// pool and thought labels stay with their role; tool and unknown roles are
/// left out.
pub fn pool_by_role(ordered: &OrderedMessages<'_>, options: &ClassifierOptions) -> RolePools {
    let mut pools = RolePools::default();

    for entry in &ordered.nodes {
        let role = entry.message.role();
        if !matches!(role, Role::User | Role::Assistant | Role::System) {
            continue;
        }

        let mut touched_thought = false;
        for segment in segments(&entry.message.content) {
            let pool = match (role, segment.kind()) {
                (_, PartKind::Thought) => {
                    touched_thought = true;
                    &mut pools.thought
                }
                (Role::User, _) => &mut pools.user,
                (Role::System, _) => &mut pools.system,
                _ => &mut pools.assistant,
            };

            match segment {
                Segment::Text { text, .. } => pool.push_text(text),
                Segment::Placeholder { kind: PartKind::Attachment, content_type } => {
                    pool.fixed_tokens += options.non_text_part_tokens;
                    pools.annotations.push(Annotation::NonTextPart {
                        node_id: entry.id.to_string(),
                        content_type: content_type.to_string(),
                        tokens: options.non_text_part_tokens,
                    });
                }
                Segment::Placeholder { kind: PartKind::Recap, .. } => {}
                Segment::Placeholder { content_type, .. } => {
                    pool.fixed_tokens += options.unsupported_part_tokens;
                    pools.annotations.push(Annotation::UnsupportedContent {
                        node_id: entry.id.to_string(),
                        content_type: content_type.to_string(),
                        tokens: options.unsupported_part_tokens,
                    });
                }
            }
        }

        match role {
            Role::User => pools.user.messages += 1,
            Role::System => pools.system.messages += 1,
            _ => pools.assistant.messages += 1,
        }
        if touched_thought {
            pools.thought.messages += 1;
        }
    }

    pools
}
