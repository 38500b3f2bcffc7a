//! Message Ordering
//!
//! Reconstructs the linear message sequence of a conversation from its
//! tree-shaped mapping. The mapping may have missing parents, dangling child
//! references and cycles; the walk is iterative and visits each node at most
//! once, so every input produces a finite (possibly empty) sequence.
//!
//! ## Strategy
//!
//! 1. If the export names an active leaf (`current_node`) and
//!    [`OrderingOptions::follow_current_node`] is set, the sequence is the
//!    parent chain from that leaf back to its root.
//! 2. Otherwise each root is walked forward, choosing one child per node
//!    according to [`BranchPolicy`].
//!
//! Branch selection is a heuristic modelled on "the last edited or
//! regenerated reply wins". It is not guaranteed correct on adversarial trees.

use crate::models::{Annotation, Conversation, Message, MessageNode, CLIENT_ROOT_ID};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPolicy {
    /// Prefer children with a payload, then the latest timestamp, then the last listed.
    #[default]
    LatestTimestamp,
    LastChild,
    FirstChild,
}

impl FromStr for BranchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "latest_timestamp" => Ok(BranchPolicy::LatestTimestamp),
            "last_child" => Ok(BranchPolicy::LastChild),
            "first_child" => Ok(BranchPolicy::FirstChild),
            other => anyhow::bail!("Unknown branch policy: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingOptions {
    pub branch_policy: BranchPolicy,
    pub follow_current_node: bool,
}

impl Default for OrderingOptions {
    fn default() -> Self {
        Self {
            branch_policy: BranchPolicy::LatestTimestamp,
            follow_current_node: true,
        }
    }
}

/// A mapping entry that carries a message payload.
#[derive(Debug, Clone, Copy)]
pub struct OrderedNode<'a> {
    pub id: &'a str,
    pub node: &'a MessageNode,
    pub message: &'a Message,
}

#[derive(Debug, Clone, Default)]
pub struct OrderedMessages<'a> {
    pub nodes: Vec<OrderedNode<'a>>,
    pub annotations: Vec<Annotation>,
}

impl<'a> OrderedMessages<'a> {
    pub fn ids(&self) -> Vec<&'a str> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub fn order_messages<'a>(conversation: &'a Conversation, options: &OrderingOptions) -> OrderedMessages<'a> {
    order_mapping(&conversation.mapping, conversation.current_node.as_deref(), options)
}

pub fn order_mapping<'a>(
    mapping: &'a HashMap<String, MessageNode>,
    current_node: Option<&str>,
    options: &OrderingOptions,
) -> OrderedMessages<'a> {
    let mut walk = Walk {
        mapping,
        policy: options.branch_policy,
        visited: HashSet::new(),
        path: HashSet::new(),
        out: OrderedMessages::default(),
    };

    if mapping.is_empty() {
        return walk.out;
    }

    if options.follow_current_node {
        if let Some((leaf, _)) = current_node.and_then(|id| mapping.get_key_value(id)) {
            walk.follow_parents(leaf);
            return walk.out;
        }
    }

    let roots = find_roots(mapping);
    if roots.is_empty() {
        // Pure cycle: start from the lexicographically first id.
        if let Some(first) = mapping.keys().min() {
            debug!(node_id = %first, "No resolvable root, using synthetic root");
            walk.out.annotations.push(Annotation::SyntheticRoot {
                node_id: first.clone(),
            });
            walk.follow_children(first);
        }
    } else {
        for root in roots {
            walk.follow_children(root);
        }
    }

    walk.out
}

/// Nodes whose parent is absent or unresolvable, in a deterministic order.
pub fn find_roots(mapping: &HashMap<String, MessageNode>) -> Vec<&str> {
    let mut roots: Vec<(&str, &MessageNode)> = mapping
        .iter()
        .filter(|(_, node)| {
            node.parent
                .as_deref()
                .map_or(true, |parent| !mapping.contains_key(parent))
        })
        .map(|(id, node)| (id.as_str(), node))
        .collect();

    roots.sort_by(|(a_id, a), (b_id, b)| {
        (*a_id != CLIENT_ROOT_ID)
            .cmp(&(*b_id != CLIENT_ROOT_ID))
            .then_with(|| earliest_first(node_time(a), node_time(b)))
            .then_with(|| a_id.cmp(b_id))
    });

    roots.into_iter().map(|(id, _)| id).collect()
}

fn node_time(node: &MessageNode) -> Option<f64> {
    node.message
        .as_ref()
        .and_then(|m| m.create_time.or(m.update_time))
}

/// Timestamped nodes before untimed ones, earliest first.
fn earliest_first(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

struct Walk<'a> {
    mapping: &'a HashMap<String, MessageNode>,
    policy: BranchPolicy,
    visited: HashSet<&'a str>,
    /// Nodes of the forward walk in progress.
    path: HashSet<&'a str>,
    out: OrderedMessages<'a>,
}

impl<'a> Walk<'a> {
    fn emit(&mut self, id: &'a str, node: &'a MessageNode) {
        if let Some(message) = node.message.as_ref() {
            self.out.nodes.push(OrderedNode { id, node, message });
        }
    }

    fn follow_parents(&mut self, leaf: &'a str) {
        let mapping = self.mapping;
        let mut chain = Vec::new();
        let mut current = Some(leaf);

        while let Some(id) = current {
            if !self.visited.insert(id) {
                self.out.annotations.push(Annotation::CycleDetected {
                    node_id: id.to_string(),
                });
                break;
            }
            let Some((key, node)) = mapping.get_key_value(id) else {
                break;
            };
            chain.push((key.as_str(), node));
            current = node
                .parent
                .as_deref()
                .and_then(|parent| mapping.get_key_value(parent))
                .map(|(key, _)| key.as_str());
        }

        for (id, node) in chain.into_iter().rev() {
            self.emit(id, node);
        }
    }

    fn follow_children(&mut self, root: &'a str) {
        let mapping = self.mapping;
        let mut current = Some(root);
        self.path.clear();

        while let Some(id) = current {
            if !self.visited.insert(id) {
                self.revisited(id);
                break;
            }
            self.path.insert(id);
            let Some(node) = mapping.get(id) else {
                break;
            };
            self.emit(id, node);
            current = self.pick_child(id, node);
        }
    }

    /// A visited node on the current walk closes a cycle; one from an earlier
    /// walk is a shared reference.
    fn revisited(&mut self, id: &str) {
        let node_id = id.to_string();
        let annotation = if self.path.contains(id) {
            Annotation::CycleDetected { node_id }
        } else {
            Annotation::RevisitedNode { node_id }
        };
        self.out.annotations.push(annotation);
    }

    fn pick_child(&mut self, parent_id: &str, node: &'a MessageNode) -> Option<&'a str> {
        let mapping = self.mapping;
        let mut candidates: Vec<(&'a str, &'a MessageNode)> = Vec::with_capacity(node.children.len());

        for child in &node.children {
            match mapping.get_key_value(child.as_str()) {
                None => self.out.annotations.push(Annotation::DanglingChild {
                    parent_id: parent_id.to_string(),
                    child_id: child.clone(),
                }),
                Some((key, _)) if self.visited.contains(key.as_str()) => self.revisited(key),
                Some((key, child_node)) => candidates.push((key.as_str(), child_node)),
            }
        }

        let chosen = match self.policy {
            BranchPolicy::FirstChild => candidates.first().copied(),
            BranchPolicy::LastChild => candidates.last().copied(),
            BranchPolicy::LatestTimestamp => candidates
                .iter()
                .copied()
                .reduce(|best, next| {
                    // Later-listed children win ties.
                    if branch_rank(next.1, best.1) == Ordering::Less {
                        best
                    } else {
                        next
                    }
                }),
        };

        if candidates.len() > 1 {
            if let Some((id, _)) = chosen {
                debug!(parent_id, chosen = id, branches = candidates.len(), "Selected branch");
            }
        }

        chosen.map(|(id, _)| id)
    }
}

/// Orders two sibling branches: payload present beats absent, then later timestamp.
fn branch_rank(a: &MessageNode, b: &MessageNode) -> Ordering {
    a.message
        .is_some()
        .cmp(&b.message.is_some())
        .then_with(|| match (node_time(a), node_time(b)) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Author, Content, ContentPart, Role};

    fn message(role: Role, text: &str, time: Option<f64>) -> Message {
        Message {
            author: Author { role, name: None },
            create_time: time,
            content: Content::Text {
                parts: vec![ContentPart::Text(text.to_string())],
            },
            ..Default::default()
        }
    }

    fn node(parent: Option<&str>, children: &[&str], message: Option<Message>) -> MessageNode {
        MessageNode {
            id: None,
            message,
            parent: parent.map(str::to_string),
            children: children.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn mapping(entries: Vec<(&str, MessageNode)>) -> HashMap<String, MessageNode> {
        entries.into_iter().map(|(id, n)| (id.to_string(), n)).collect()
    }

    fn no_leaf() -> OrderingOptions {
        OrderingOptions {
            follow_current_node: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_mapping() {
        let map = HashMap::new();
        let ordered = order_mapping(&map, None, &OrderingOptions::default());
        assert!(ordered.is_empty());
        assert!(ordered.annotations.is_empty());
    }

    #[test]
    fn test_linear_chain_skips_placeholder_root() {
        let map = mapping(vec![
            ("root", node(None, &["a"], None)),
            ("a", node(Some("root"), &["b"], Some(message(Role::User, "hi", Some(1.0))))),
            ("b", node(Some("a"), &[], Some(message(Role::Assistant, "hello", Some(2.0))))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_two_node_cycle_terminates() {
        let map = mapping(vec![
            ("a", node(Some("b"), &["b"], Some(message(Role::User, "a", None)))),
            ("b", node(Some("a"), &["a"], Some(message(Role::Assistant, "b", None)))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["a", "b"]);
        assert!(ordered
            .annotations
            .contains(&Annotation::SyntheticRoot { node_id: "a".to_string() }));
        assert!(ordered
            .annotations
            .iter()
            .any(|a| matches!(a, Annotation::CycleDetected { .. })));
    }

    #[test]
    fn test_later_timestamp_branch_wins() {
        let map = mapping(vec![
            ("root", node(None, &["late", "early"], Some(message(Role::User, "q", Some(1.0))))),
            ("early", node(Some("root"), &[], Some(message(Role::Assistant, "old", Some(2.0))))),
            ("late", node(Some("root"), &[], Some(message(Role::Assistant, "new", Some(5.0))))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["root", "late"]);
    }

    #[test]
    fn test_untimed_siblings_take_last_child() {
        let map = mapping(vec![
            ("root", node(None, &["first", "second"], None)),
            ("first", node(Some("root"), &[], Some(message(Role::Assistant, "1", None)))),
            ("second", node(Some("root"), &[], Some(message(Role::Assistant, "2", None)))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["second"]);

        let first_policy = OrderingOptions {
            branch_policy: BranchPolicy::FirstChild,
            follow_current_node: false,
        };
        assert_eq!(order_mapping(&map, None, &first_policy).ids(), vec!["first"]);
    }

    #[test]
    fn test_payload_beats_placeholder_sibling() {
        let map = mapping(vec![
            ("root", node(None, &["real", "hollow"], None)),
            ("real", node(Some("root"), &[], Some(message(Role::User, "x", None)))),
            ("hollow", node(Some("root"), &[], None)),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["real"]);
    }

    #[test]
    fn test_dangling_references() {
        let map = mapping(vec![
            ("orphan", node(Some("missing-parent"), &["ghost", "kid"], Some(message(Role::User, "x", None)))),
            ("kid", node(Some("orphan"), &[], Some(message(Role::Assistant, "y", None)))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());
        assert_eq!(ordered.ids(), vec!["orphan", "kid"]);
        assert!(ordered.annotations.contains(&Annotation::DanglingChild {
            parent_id: "orphan".to_string(),
            child_id: "ghost".to_string(),
        }));
    }

    #[test]
    fn test_current_node_path() {
        let map = mapping(vec![
            (CLIENT_ROOT_ID, node(None, &["q"], None)),
            ("q", node(Some(CLIENT_ROOT_ID), &["a1", "a2"], Some(message(Role::User, "q", Some(1.0))))),
            ("a1", node(Some("q"), &[], Some(message(Role::Assistant, "first", Some(2.0))))),
            ("a2", node(Some("q"), &[], Some(message(Role::Assistant, "second", Some(3.0))))),
        ]);
        let ordered = order_mapping(&map, Some("a1"), &OrderingOptions::default());
        assert_eq!(ordered.ids(), vec!["q", "a1"]);

        // Unresolvable leaf falls back to the branch heuristic.
        let ordered = order_mapping(&map, Some("nope"), &OrderingOptions::default());
        assert_eq!(ordered.ids(), vec!["q", "a2"]);
    }

    #[test]
    fn test_client_root_ordered_first() {
        let map = mapping(vec![
            ("stray", node(None, &[], Some(message(Role::User, "stray", Some(0.5))))),
            (CLIENT_ROOT_ID, node(None, &["m"], None)),
            ("m", node(Some(CLIENT_ROOT_ID), &[], Some(message(Role::User, "m", Some(9.0))))),
        ]);
        assert_eq!(find_roots(&map), vec![CLIENT_ROOT_ID, "stray"]);
        assert_eq!(order_mapping(&map, None, &no_leaf()).ids(), vec!["m", "stray"]);
    }

    #[test]
    fn test_shared_child_is_not_a_cycle() {
        let map = mapping(vec![
            ("r1", node(None, &["shared"], Some(message(Role::User, "1", None)))),
            ("r2", node(None, &["shared"], Some(message(Role::User, "2", None)))),
            ("shared", node(Some("r1"), &[], Some(message(Role::Assistant, "s", None)))),
        ]);
        let ordered = order_mapping(&map, None, &no_leaf());

        assert_eq!(ordered.ids(), vec!["r1", "shared", "r2"]);
        assert_eq!(
            ordered.annotations,
            vec![Annotation::RevisitedNode { node_id: "shared".to_string() }]
        );
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let map = mapping(vec![
            ("r1", node(None, &["x"], Some(message(Role::User, "1", None)))),
            ("r2", node(None, &[], Some(message(Role::User, "2", None)))),
            ("x", node(Some("r1"), &["r1"], Some(message(Role::Assistant, "3", None)))),
        ]);
        let first = order_mapping(&map, None, &no_leaf()).ids();
        let second = order_mapping(&map, None, &no_leaf()).ids();
        assert_eq!(first, second);
        assert!(first.len() <= map.values().filter(|n| n.message.is_some()).count());
    }
}
