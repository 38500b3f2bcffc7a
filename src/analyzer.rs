//! Conversation Analysis Engine
//!
//! The [`Analyzer`] holds the read-only context of a run (options, pricing
//! table, tokenizer) and turns one [`Conversation`] into one
//! [`AnalysisResult`]. It never fails on bad data: structural problems,
//! unknown models and unsupported content end up as annotations and
//! approximation flags on the result.
//!
//! ## Processing Pipeline
//!
//! 1. **Ordering**: [`crate::ordering`] linearizes the message tree
//! 2. **Classification**: [`crate::classifier`] counts tokens per turn (detailed)
//!    or per role pool (simple)
//! 3. **Costing**: [`CostAggregator`] prices tokens per model
//!
//! ## Calculation Modes
//!
//! - **detailed**: every assistant turn is billed for the full visible context
//!   before it (input) and its own text and thought labels (output); thought
//!   content is billed as scaled output. Context after the first real turn gets the configured
//!   discount.
//! - **simple**: all user and system text is input, all assistant text is
//!   output and thought content is scaled output, each pool counted once
//!   against one model.
//!
//! [`Analyzer::analyze_all`] runs a batch, in parallel with the `parallel`
//! feature, and stops early when its cancellation flag is raised.

use crate::classifier::{classify_turns, pool_by_role, ClassifierOptions};
use crate::config::Config;
use crate::models::*;
use crate::ordering::{order_messages, OrderedMessages, OrderingOptions};
use crate::pricing::{to_decimal, CostAggregator, CostSummary, PricingTable};
use crate::tokenizer::Tokenizer;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, debug_span, info, warn};

/// Progress is logged every this many conversations.
const PROGRESS_INTERVAL: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    pub thought_multiplier: f64,
    pub non_text_part_tokens: u64,
    pub unsupported_part_tokens: u64,
    pub include_incomplete_turns: bool,
    pub context_discount: f64,
    pub simple_model: String,
    pub ordering: OrderingOptions,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self::from(&crate::config::AnalysisConfig::default())
    }
}

impl From<&crate::config::AnalysisConfig> for AnalysisOptions {
    fn from(config: &crate::config::AnalysisConfig) -> Self {
        Self {
            thought_multiplier: config.thought_multiplier,
            non_text_part_tokens: config.non_text_part_tokens,
            unsupported_part_tokens: config.unsupported_part_tokens,
            include_incomplete_turns: config.include_incomplete_turns,
            context_discount: config.context_discount,
            simple_model: config.simple_model.clone(),
            ordering: OrderingOptions {
                branch_policy: config.branch_policy,
                follow_current_node: config.follow_current_node,
            },
        }
    }
}

impl AnalysisOptions {
    fn classifier(&self) -> ClassifierOptions {
        ClassifierOptions {
            non_text_part_tokens: self.non_text_part_tokens,
            unsupported_part_tokens: self.unsupported_part_tokens,
        }
    }
}

/// Results of a batch; `cancelled` is set when the scan stopped early.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<AnalysisResult>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    options: AnalysisOptions,
    pricing: PricingTable,
    tokenizer: Tokenizer,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Analyzer {
    pub fn new(options: AnalysisOptions, pricing: PricingTable, tokenizer: Tokenizer) -> Self {
        Self {
            options,
            pricing,
            tokenizer,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            AnalysisOptions::from(&config.analysis),
            config.pricing.clone(),
            config.tokenizer.build(),
        )
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Linear message sequence under this analyzer's ordering options.
    pub fn order<'a>(&self, conversation: &'a Conversation) -> OrderedMessages<'a> {
        order_messages(conversation, &self.options.ordering)
    }

    pub fn analyze(&self, conversation: &Conversation, mode: Mode) -> AnalysisResult {
        let _span = debug_span!("analyze", conversation_id = conversation.id(), %mode).entered();

        let ordered = self.order(conversation);
        let mut result = AnalysisResult {
            conversation_id: conversation.id().to_string(),
            title: conversation.title().to_string(),
            create_time: conversation.create_time,
            update_time: conversation.update_time,
            mode,
            message_count: ordered.len(),
            real_turns: ordered
                .nodes
                .iter()
                .filter(|n| n.message.ends_turn() && !n.message.role().is_structural())
                .count(),
            assistant_messages: ordered
                .nodes
                .iter()
                .filter(|n| n.message.role() == Role::Assistant)
                .count(),
            annotations: ordered.annotations.clone(),
            ..Default::default()
        };

        let costs = match mode {
            Mode::Detailed => self.analyze_detailed(&ordered, &mut result),
            Mode::Simple => self.analyze_simple(&ordered, &mut result),
        };

        result.tokens = costs.tokens;
        result.input_cost = costs.input_cost;
        result.output_cost = costs.output_cost;
        result.total_cost = costs.total_cost;
        result.models = costs.models;
        result.cost_approximate = costs.approximate;
        result.annotations.extend(costs.annotations);

        debug!(
            messages = result.message_count,
            real_turns = result.real_turns,
            total_tokens = result.tokens.total(),
            cost = %result.total_cost,
            "Conversation analyzed"
        );

        result
    }

    fn analyze_detailed(&self, ordered: &OrderedMessages<'_>, result: &mut AnalysisResult) -> CostSummary {
        let turns = classify_turns(ordered, &self.tokenizer, &self.options.classifier());

        // Messages after the last real turn belong to an unfinished exchange.
        let cutoff = if self.options.include_incomplete_turns {
            turns.len()
        } else {
            turns.iter().rposition(|t| t.is_real_turn).map_or(0, |i| i + 1)
        };

        let discount = to_decimal(self.options.context_discount);
        let mut costs = CostAggregator::new(&self.pricing, self.options.thought_multiplier);
        let mut approximate_models = BTreeSet::new();
        let mut context: u64 = 0;

        for (index, turn) in turns.into_iter().enumerate() {
            let visible = turn.visible_tokens();
            let thought = turn.thought_tokens();
            let summary = turn.thought_summary_tokens();
            let counted = index < cutoff && turn.role == Role::Assistant;

            let mut detail = TurnDetail {
                node_id: turn.node_id,
                role: turn.role,
                model: turn.model,
                exchange: turn.exchange,
                is_real_turn: turn.is_real_turn,
                counted,
                content_tokens: visible,
                tokens: TokenTotals::default(),
                input_cost: Decimal::ZERO,
                output_cost: Decimal::ZERO,
                cost: Decimal::ZERO,
                context_discounted: false,
                approximate: turn.approximate,
                annotations: turn.annotations,
            };

            if counted {
                let tokens = TokenTotals {
                    input: context,
                    output: visible + summary,
                    thought,
                };
                let discounted = turn.exchange > 0;
                let scale = if discounted { discount } else { Decimal::ONE };
                let charge = costs.record(&detail.model, 1, tokens, scale);

                detail.tokens = tokens;
                detail.input_cost = charge.input_cost;
                detail.output_cost = charge.output_cost;
                detail.cost = charge.total();
                detail.context_discounted = discounted;
            }

            if detail.approximate {
                result.tokens_approximate = true;
                if approximate_models.insert(detail.model.clone()) {
                    warn!(model = %detail.model, "No tokenizer for model, token counts are approximate");
                    result.annotations.push(Annotation::ApproximateTokens {
                        model: detail.model.to_string(),
                    });
                }
            }

            result.annotations.extend(detail.annotations.iter().cloned());
            context += visible;
            result.turns.push(detail);
        }

        costs.finish()
    }

    fn analyze_simple(&self, ordered: &OrderedMessages<'_>, result: &mut AnalysisResult) -> CostSummary {
        let pools = pool_by_role(ordered, &self.options.classifier());
        let model = ModelId::Named(self.options.simple_model.clone());

        let user = pools.user.count(&self.tokenizer, &model);
        let assistant = pools.assistant.count(&self.tokenizer, &model);
        let system = pools.system.count(&self.tokenizer, &model);
        let thought = pools.thought.count(&self.tokenizer, &model);

        result.role_tokens = Some(RoleTokens {
            user: user.tokens,
            assistant: assistant.tokens,
            system: system.tokens,
            thought: thought.tokens,
        });
        result.annotations.extend(pools.annotations);

        if [user, assistant, system, thought].iter().any(|c| c.approximate) {
            warn!(model = %model, "No tokenizer for model, token counts are approximate");
            result.tokens_approximate = true;
            result.annotations.push(Annotation::ApproximateTokens {
                model: model.to_string(),
            });
        }

        let mut costs = CostAggregator::new(&self.pricing, self.options.thought_multiplier);
        if result.message_count > 0 {
            let tokens = TokenTotals {
                input: user.tokens + system.tokens,
                output: assistant.tokens,
                thought: thought.tokens,
            };
            costs.record(&model, result.message_count, tokens, Decimal::ONE);
        }
        costs.finish()
    }

    /// Analyzes every conversation, checking `cancel` between conversations.
    pub fn analyze_all(&self, conversations: &[Conversation], mode: Mode, cancel: &AtomicBool) -> BatchOutcome {
        let total = conversations.len();
        info!(conversations = total, %mode, "Starting analysis");

        #[cfg(feature = "parallel")]
        let outcome = {
            use rayon::prelude::*;
            use std::sync::atomic::AtomicUsize;

            let done = AtomicUsize::new(0);
            let results: Vec<Option<AnalysisResult>> = conversations
                .par_iter()
                .map(|conversation| {
                    if cancel.load(Ordering::Relaxed) {
                        return None;
                    }
                    let result = self.analyze(conversation, mode);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if finished % PROGRESS_INTERVAL == 0 {
                        info!(analyzed = finished, total, "Analysis progress");
                    }
                    Some(result)
                })
                .collect();

            let cancelled = results.iter().any(Option::is_none);
            BatchOutcome {
                results: results.into_iter().flatten().collect(),
                cancelled,
            }
        };

        #[cfg(not(feature = "parallel"))]
        let outcome = {
            let mut outcome = BatchOutcome {
                results: Vec::with_capacity(total),
                cancelled: false,
            };
            for (index, conversation) in conversations.iter().enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    outcome.cancelled = true;
                    break;
                }
                outcome.results.push(self.analyze(conversation, mode));
                if (index + 1) % PROGRESS_INTERVAL == 0 {
                    info!(analyzed = index + 1, total, "Analysis progress");
                }
            }
            outcome
        };

        if outcome.cancelled {
            warn!(
                analyzed = outcome.results.len(),
                total, "Analysis cancelled, results are partial"
            );
        } else {
            info!(analyzed = outcome.results.len(), "Analysis complete");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{ModelRate, LAST_RESORT_RATE};
    use serde_json::{json, Value};

    /// `client-created-root` followed by a chain of the given messages.
    fn linear(messages: Vec<Value>) -> Conversation {
        let mut mapping = serde_json::Map::new();
        let ids: Vec<String> = (0..messages.len()).map(|i| format!("m{}", i)).collect();
        mapping.insert(
            CLIENT_ROOT_ID.to_string(),
            json!({"id": CLIENT_ROOT_ID, "message": null, "parent": null, "children": ids.first().cloned().into_iter().collect::<Vec<_>>()}),
        );
        for (i, message) in messages.into_iter().enumerate() {
            let parent = if i == 0 { CLIENT_ROOT_ID.to_string() } else { ids[i - 1].clone() };
            mapping.insert(
                ids[i].clone(),
                json!({"id": ids[i], "message": message, "parent": parent, "children": ids.get(i + 1).cloned().into_iter().collect::<Vec<_>>()}),
            );
        }
        serde_json::from_value(json!({"id": "conv", "title": "Test", "create_time": 1_700_000_000.0, "mapping": mapping}))
            .unwrap()
    }

    fn message(role: &str, text: &str, model: Option<&str>, end_turn: bool) -> Value {
        let mut metadata = serde_json::Map::new();
        if let Some(model) = model {
            metadata.insert("model_slug".to_string(), json!(model));
        }
        json!({
            "author": {"role": role},
            "content": {"content_type": "text", "parts": [text]},
            "end_turn": end_turn,
            "metadata": metadata,
        })
    }

    fn count(analyzer: &Analyzer, text: &str, model: &ModelId) -> u64 {
        analyzer.tokenizer().count(text, model).tokens
    }

    #[test]
    fn test_simple_mode_single_user_turn() {
        let pricing = PricingTable::new("default", LAST_RESORT_RATE).with_model("default", ModelRate::new(1.0, 2.0));
        let analyzer = Analyzer::new(AnalysisOptions::default(), pricing, Tokenizer::default());
        let conversation = linear(vec![message("user", "hi", None, true)]);

        let result = analyzer.analyze(&conversation, Mode::Simple);

        assert_eq!(result.real_turns, 1);
        assert_eq!(result.message_count, 1);
        let tokens = result.tokens.input;
        assert!(tokens > 0 && tokens < 5);
        assert_eq!(result.total_cost, Decimal::from(tokens) / Decimal::from(1_000_000));
        assert!(result.cost_approximate, "simple model is not priced, default model used");
        assert_eq!(result.role_tokens.unwrap().user, tokens);
    }

    #[test]
    fn test_detailed_context_accumulates() {
        let analyzer = Analyzer::default();
        let conversation = linear(vec![
            message("user", "What is the capital of France?", None, false),
            message("assistant", "Paris.", Some("gpt-4o"), true),
            message("user", "And of Italy?", None, false),
            message("assistant", "Rome.", Some("gpt-4o"), true),
        ]);
        let result = analyzer.analyze(&conversation, Mode::Detailed);

        let gpt = ModelId::Named("gpt-4o".to_string());
        let q1 = count(&analyzer, "What is the capital of France?", &ModelId::Unspecified);
        let a1 = count(&analyzer, "Paris.", &gpt);
        let q2 = count(&analyzer, "And of Italy?", &ModelId::Unspecified);
        let a2 = count(&analyzer, "Rome.", &gpt);

        assert_eq!(result.real_turns, 2);
        assert_eq!(result.turns.len(), 4);
        let billed: Vec<_> = result.turns.iter().filter(|t| t.counted).collect();
        assert_eq!(billed.len(), 2);
        assert_eq!(billed[0].tokens.input, q1);
        assert_eq!(billed[0].tokens.output, a1);
        assert!(!billed[0].context_discounted);
        assert_eq!(billed[1].tokens.input, q1 + a1 + q2);
        assert_eq!(billed[1].tokens.output, a2);
        assert!(billed[1].context_discounted);

        // gpt-4o: 2.5 in / 10 out, second input at half rate
        let million = Decimal::from(1_000_000);
        let expected_input = Decimal::from(q1) * Decimal::new(25, 1) / million
            + Decimal::from(q1 + a1 + q2) * Decimal::new(25, 1) / million * Decimal::new(5, 1);
        assert_eq!(result.input_cost, expected_input);
        assert!(!result.is_approximate());
    }

    #[test]
    fn test_incomplete_trailing_exchange_not_counted() {
        let conversation = linear(vec![
            message("user", "one", None, false),
            message("assistant", "two", Some("gpt-4o"), true),
            message("user", "three", None, false),
            message("assistant", "partial", Some("gpt-4o"), false),
        ]);

        let result = Analyzer::default().analyze(&conversation, Mode::Detailed);
        assert_eq!(result.turns.iter().filter(|t| t.counted).count(), 1);
        assert!(!result.turns[3].counted);
        assert_eq!(result.turns[3].cost, Decimal::ZERO);

        let mut config = Config::default();
        config.analysis.include_incomplete_turns = true;
        let result = Analyzer::from_config(&config).analyze(&conversation, Mode::Detailed);
        assert_eq!(result.turns.iter().filter(|t| t.counted).count(), 2);
    }

    #[test]
    fn test_cost_additivity_across_models() {
        let conversation = linear(vec![
            message("user", "a question", None, false),
            message("assistant", "first answer", Some("gpt-4o"), true),
            message("user", "follow up", None, false),
            message("assistant", "second answer", Some("o1"), true),
            message("user", "again", None, false),
            message("assistant", "third answer", None, true),
        ]);
        let result = Analyzer::default().analyze(&conversation, Mode::Detailed);

        assert_eq!(result.models.len(), 3);
        assert_eq!(result.total_cost, result.model_cost_sum());
        assert_eq!(result.total_cost, result.input_cost + result.output_cost);
    }

    #[test]
    fn test_sentinel_model_preserved() {
        let conversation = linear(vec![
            message("user", "q", None, false),
            message("assistant", "no slug", None, true),
        ]);
        let result = Analyzer::default().analyze(&conversation, Mode::Detailed);

        assert!(result.models.contains_key(&ModelId::Unspecified));
        assert_eq!(result.models[&ModelId::Unspecified].rate_source, RateSource::DefaultModel);
        assert!(result.cost_approximate);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["models"][0]["model"], "N/A");
        assert_eq!(json["models"][0]["unspecified"], true);
    }

    #[test]
    fn test_literal_na_slug_kept_apart_from_sentinel() {
        let conversation = linear(vec![
            message("user", "q", None, false),
            message("assistant", "no slug", None, true),
            message("user", "again", None, false),
            message("assistant", "literal slug", Some("N/A"), true),
        ]);
        let result = Analyzer::default().analyze(&conversation, Mode::Detailed);

        assert_eq!(result.models.len(), 2);
        assert!(result.models.contains_key(&ModelId::Unspecified));
        assert!(result.models.contains_key(&ModelId::Named("N/A".to_string())));
        assert_eq!(result.total_cost, result.model_cost_sum());

        let text = serde_json::to_string(&result).unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        let entries = json["models"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e["model"] == "N/A"));
        assert_eq!(entries.iter().filter(|e| e["unspecified"] == true).count(), 1);
        let messages: u64 = entries.iter().map(|e| e["messages"].as_u64().unwrap()).sum();
        assert_eq!(messages, 2);
    }

    #[test]
    fn test_simple_mode_thought_pool_scaled() {
        let options = AnalysisOptions {
            simple_model: "gpt-4o".to_string(),
            thought_multiplier: 2.0,
            ..Default::default()
        };
        let pricing = PricingTable::new("gpt-4o", LAST_RESORT_RATE).with_model("gpt-4o", ModelRate::new(0.0, 1.0));
        let analyzer = Analyzer::new(options, pricing, Tokenizer::default());
        let conversation = linear(vec![
            message("user", "q", None, false),
            json!({
                "author": {"role": "assistant"},
                "content": {"content_type": "thoughts", "thoughts": [{"summary": "Label", "content": "reasoning here"}]},
            }),
            message("assistant", "answer", Some("gpt-4o"), true),
        ]);

        let result = analyzer.analyze(&conversation, Mode::Simple);

        let gpt = ModelId::Named("gpt-4o".to_string());
        let labelled_answer = count(&analyzer, "Label\nanswer", &gpt);
        let thought = count(&analyzer, "reasoning here", &gpt);
        let roles = result.role_tokens.unwrap();
        assert_eq!(roles.assistant, labelled_answer);
        assert_eq!(roles.thought, thought);
        assert_eq!(result.input_cost, Decimal::ZERO);
        assert_eq!(
            result.output_cost,
            Decimal::from(labelled_answer + 2 * thought) / Decimal::from(1_000_000)
        );
    }

    #[test]
    fn test_thought_label_billed_unscaled() {
        let options = AnalysisOptions {
            thought_multiplier: 2.0,
            ..Default::default()
        };
        let pricing = PricingTable::new("gpt-4o", LAST_RESORT_RATE).with_model("gpt-4o", ModelRate::new(0.0, 1.0));
        let analyzer = Analyzer::new(options, pricing, Tokenizer::default());
        let conversation = linear(vec![
            message("user", "q", None, false),
            json!({
                "author": {"role": "assistant"},
                "content": {"content_type": "thoughts", "thoughts": [{"summary": "Label", "content": "reasoning here"}]},
                "metadata": {"model_slug": "gpt-4o"},
            }),
            message("assistant", "answer", Some("gpt-4o"), true),
        ]);

        let result = analyzer.analyze(&conversation, Mode::Detailed);

        let gpt = ModelId::Named("gpt-4o".to_string());
        let label = count(&analyzer, "Label", &gpt);
        let thought = count(&analyzer, "reasoning here", &gpt);
        let reasoning = &result.turns[1];
        assert!(reasoning.counted);
        assert_eq!(reasoning.tokens.output, label);
        assert_eq!(reasoning.tokens.thought, thought);
        assert_eq!(
            reasoning.output_cost,
            Decimal::from(label + 2 * thought) / Decimal::from(1_000_000)
        );
        // neither label nor content is context for the reply
        assert_eq!(result.turns[2].tokens.input, count(&analyzer, "q", &ModelId::Unspecified));
    }

    #[test]
    fn test_last_resort_rate_flagged() {
        let pricing = PricingTable::new("missing", ModelRate::new(3.0, 6.0));
        let analyzer = Analyzer::new(AnalysisOptions::default(), pricing, Tokenizer::default());
        let conversation = linear(vec![
            message("user", "q", None, false),
            message("assistant", "answer", Some("gpt-4o"), true),
        ]);
        let result = analyzer.analyze(&conversation, Mode::Detailed);

        let usage = &result.models[&ModelId::Named("gpt-4o".to_string())];
        assert_eq!(usage.rate_source, RateSource::LastResort);
        assert!(result
            .annotations
            .iter()
            .any(|a| matches!(a, Annotation::PriceFallback { source: RateSource::LastResort, .. })));
    }

    #[test]
    fn test_turns_never_exceed_payload_nodes() {
        let conversation: Conversation = serde_json::from_value(json!({
            "id": "cyclic",
            "mapping": {
                "a": {"id": "a", "parent": "b", "children": ["b", "ghost"], "message": message("user", "x", None, true)},
                "b": {"id": "b", "parent": "a", "children": ["a"], "message": message("assistant", "y", None, true)},
                "c": {"id": "c", "parent": "a", "children": [], "message": null}
            }
        }))
        .unwrap();

        let result = Analyzer::default().analyze(&conversation, Mode::Detailed);
        assert!(result.turns.len() <= 2);
        assert!(!result.annotations.is_empty());
    }

    #[test]
    fn test_empty_conversation_is_zero() {
        let conversation = Conversation::default();
        for mode in [Mode::Detailed, Mode::Simple] {
            let result = Analyzer::default().analyze(&conversation, mode);
            assert_eq!(result.message_count, 0);
            assert_eq!(result.total_cost, Decimal::ZERO);
            assert!(result.models.is_empty());
        }
    }

    #[test]
    fn test_analyze_all_respects_cancellation() {
        let conversations = vec![linear(vec![message("user", "hi", None, true)]); 3];
        let analyzer = Analyzer::default();

        let done = analyzer.analyze_all(&conversations, Mode::Simple, &AtomicBool::new(false));
        assert_eq!(done.results.len(), 3);
        assert!(!done.cancelled);

        let stopped = analyzer.analyze_all(&conversations, Mode::Simple, &AtomicBool::new(true));
        assert!(stopped.results.is_empty());
        assert!(stopped.cancelled);
    }
}
