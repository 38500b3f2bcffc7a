#![allow(dead_code)]

use anyhow::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// 2024-01-01 00:00:00 UTC
pub const JAN_1: f64 = 1_704_067_200.0;
/// 2024-01-02 00:00:00 UTC
pub const JAN_2: f64 = 1_704_153_600.0;

pub fn text_message(role: &str, text: &str, model: Option<&str>, end_turn: Option<bool>, created: Option<f64>) -> Value {
    let mut metadata = serde_json::Map::new();
    if let Some(model) = model {
        metadata.insert("model_slug".to_string(), json!(model));
    }
    json!({
        "author": {"role": role},
        "create_time": created,
        "content": {"content_type": "text", "parts": [text]},
        "end_turn": end_turn,
        "metadata": metadata,
    })
}

pub fn node(id: &str, parent: Option<&str>, children: &[&str], message: Value) -> Value {
    json!({"id": id, "parent": parent, "children": children, "message": message})
}

/// Regenerated reply: `a_old` and `a_new` are siblings, the newer one is on the thread.
pub fn branching_conversation() -> Value {
    json!({
        "id": "c-branch",
        "title": "Trip planning",
        "create_time": JAN_1,
        "mapping": {
            "client-created-root": node("client-created-root", None, &["u1"], Value::Null),
            "u1": node("u1", Some("client-created-root"), &["a_old", "a_new"],
                text_message("user", "Plan a trip to Rome", None, None, Some(JAN_1 + 1.0))),
            "a_old": node("a_old", Some("u1"), &[],
                text_message("assistant", "Old answer", Some("gpt-4o"), Some(true), Some(JAN_1 + 10.0))),
            "a_new": node("a_new", Some("u1"), &["u2"],
                text_message("assistant", "New answer with an itinerary", Some("gpt-4o"), Some(true), Some(JAN_1 + 20.0))),
            "u2": node("u2", Some("a_new"), &["a3"],
                text_message("user", "Thanks", None, None, Some(JAN_1 + 30.0))),
            "a3": node("a3", Some("u2"), &[],
                text_message("assistant", "You're welcome", Some("gpt-4o"), Some(true), Some(JAN_1 + 40.0)))
        }
    })
}

pub fn reasoning_conversation() -> Value {
    json!({
        "id": "c-think",
        "title": "Reasoning",
        "create_time": JAN_2,
        "mapping": {
            "r": node("r", None, &["u"], Value::Null),
            "u": node("u", Some("r"), &["t"], text_message("user", "Prove it", None, None, None)),
            "t": node("t", Some("u"), &["a"], json!({
                "author": {"role": "assistant"},
                "content": {"content_type": "thoughts", "thoughts": [
                    {"summary": "Approach", "content": "Use induction on n"}
                ]},
                "metadata": {"model_slug": "o1"}
            })),
            "a": node("a", Some("t"), &[], text_message("assistant", "QED", Some("o1"), Some(true), None))
        }
    })
}

pub fn unknown_model_conversation() -> Value {
    json!({
        "id": "c-unknown",
        "title": "Mystery model",
        "mapping": {
            "u": node("u", None, &["a"], text_message("user", "hello", None, None, None)),
            "a": node("a", Some("u"), &[], text_message("assistant", "hi there", Some("house-model"), Some(true), None))
        }
    })
}

pub fn cyclic_conversation() -> Value {
    json!({
        "id": "c-cycle",
        "title": "Broken tree",
        "mapping": {
            "x": node("x", Some("y"), &["y"], text_message("user", "round", None, None, None)),
            "y": node("y", Some("x"), &["x", "ghost"], text_message("assistant", "and round", None, None, None))
        }
    })
}

/// Four conversations plus one entry that is not a conversation.
pub fn sample_export() -> Value {
    json!([
        branching_conversation(),
        reasoning_conversation(),
        unknown_model_conversation(),
        cyclic_conversation(),
        42
    ])
}

pub fn write_json(dir: &Path, filename: &str, value: &Value) -> Result<PathBuf> {
    let path = dir.join(filename);
    fs::write(&path, serde_json::to_vec_pretty(value)?)?;
    Ok(path)
}
