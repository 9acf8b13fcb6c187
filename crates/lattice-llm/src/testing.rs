//! Scripted language model for tests and offline development.
//!
//! Replies come from substring rules first, then from a FIFO queue, then
//! from an optional fallback. Every prompt is recorded for assertions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use lattice_core::error::{LatticeError, Result};
use lattice_core::llm::{LanguageModel, Prompt, ResponseFormat};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Fails with `ModelUnavailable`.
    Unavailable,
    /// Fails with a permanent `Model` error.
    Fail(String),
    /// Sleeps before answering, to exercise call timeouts.
    Delayed(Duration, String),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Default)]
pub struct ScriptedModel {
    name: String,
    rules: Mutex<Vec<(String, ScriptedReply)>>,
    queue: Mutex<VecDeque<ScriptedReply>>,
    fallback: Mutex<Option<ScriptedReply>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            name: "scripted".into(),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Reply whenever the user prompt contains `needle`. Rules are checked
    /// in insertion order and never consumed.
    pub fn with_rule(self, needle: impl Into<String>, reply: ScriptedReply) -> Self {
        lock(&self.rules).push((needle.into(), reply));
        self
    }

    /// Queue a one-shot reply.
    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        lock(&self.queue).push_back(reply);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_reply(ScriptedReply::Text(text.into()))
    }

    /// Reply used once rules and queue have nothing.
    pub fn with_fallback(self, reply: ScriptedReply) -> Self {
        *lock(&self.fallback) = Some(reply);
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock(&self.queue).push_back(reply);
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        lock(&self.prompts).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.prompts).len()
    }

    fn next_reply(&self, prompt: &Prompt) -> Option<ScriptedReply> {
        let rule = lock(&self.rules)
            .iter()
            .find(|(needle, _)| prompt.user.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());
        rule.or_else(|| lock(&self.queue).pop_front())
            .or_else(|| lock(&self.fallback).clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt, _format: ResponseFormat) -> Result<String> {
        lock(&self.prompts).push(prompt.clone());
        match self.next_reply(prompt) {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Unavailable) => {
                Err(LatticeError::ModelUnavailable("scripted outage".into()))
            }
            Some(ScriptedReply::Fail(message)) => Err(LatticeError::Model(message)),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            None => Err(LatticeError::Model(format!(
                "{} has no scripted reply left",
                self.name
            ))),
        }
    }
}
