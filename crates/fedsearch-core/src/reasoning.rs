//! Boundary to the external reasoning capability.
//!
//! The reasoning capability turns a structured task description into
//! JSON-shaped output (an intent, a ranking permutation, an entity
//! string). Its output is untrusted: every consumer validates and repairs
//! it rather than propagating failures upward.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Kinds of structured output the orchestration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTask {
    /// `{goal, entities, temporal, source_hints, complexity, retrieval_plan, ...}`
    Intent,
    /// `{order: [indices]}` over the results in the input.
    Rerank,
    /// `{entity: "Name (address)" | "Name" | "NONE"}`
    Entity,
}

impl ReasoningTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningTask::Intent => "intent",
            ReasoningTask::Rerank => "rerank",
            ReasoningTask::Entity => "entity",
        }
    }
}

/// An external capability producing structured output for a task.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Produce JSON output for `task` given `input`.
    async fn complete(&self, task: ReasoningTask, input: &Value) -> Result<Value>;
}

/// Reasoner that replays canned outputs per task.
///
/// Used by tests and by benchmark cases that pin the reasoning output.
/// Tasks without a scripted output fail, which exercises the callers'
/// fallback paths.
#[derive(Default)]
pub struct ScriptedReasoner {
    outputs: HashMap<ReasoningTask, Value>,
    calls: Mutex<Vec<ReasoningTask>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, task: ReasoningTask, output: Value) -> Self {
        self.outputs.insert(task, output);
        self
    }

    /// Tasks requested so far, in order.
    pub fn calls(&self) -> Vec<ReasoningTask> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, task: ReasoningTask, _input: &Value) -> Result<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(task);
        }
        self.outputs
            .get(&task)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted output for task '{}'", task.as_str()))
    }
}

/// Pull a JSON value out of raw model text: strips code fences and
/// trailing commas before parsing.
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    let mut body = text.trim();
    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        body = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }
    let cleaned = body.trim().replace(",}", "}").replace(",]", "]");
    serde_json::from_str(&cleaned).ok()
}
