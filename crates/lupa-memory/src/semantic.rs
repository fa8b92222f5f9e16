use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lupa_core::{current_unix_timestamp_ms, new_request_id};
use lupa_store::{MemoryRow, MemoryRowStore};

const SEMANTIC_SCOPE: &str = "semantic";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One cross-session memory entry.
pub struct Memory {
    pub key: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub owner: String,
    pub created_at_unix_ms: u64,
}

#[async_trait]
/// Port for cross-session recall. The backing engine is opaque: in-process,
/// file-backed, or an external vector database all satisfy this.
pub trait SemanticRecall: Send + Sync {
    async fn store(&self, memory: Memory) -> Result<()>;
    async fn recall(&self, query: &str, k: usize) -> Result<Vec<Memory>>;
    /// Explicit delete, gated on the owning identity.
    async fn delete(&self, key: &str, owner: &str) -> Result<bool>;
}

/// Default in-process backend: token-overlap scoring over stored summaries.
/// Good enough for recall-by-topic without an embedding dependency.
pub struct LexicalSemanticRecall {
    store: Arc<MemoryRowStore>,
}

impl LexicalSemanticRecall {
    pub fn new(store: Arc<MemoryRowStore>) -> Self {
        Self { store }
    }

    fn tokenize(text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() >= 3)
            .map(str::to_string)
            .collect()
    }

    fn score(query_tokens: &BTreeSet<String>, memory: &Memory) -> f64 {
        let mut text = memory.summary.to_lowercase();
        for tag in &memory.tags {
            text.push(' ');
            text.push_str(tag);
        }
        let memory_tokens = Self::tokenize(&text);
        if query_tokens.is_empty() || memory_tokens.is_empty() {
            return 0.0;
        }
        let shared = query_tokens.intersection(&memory_tokens).count() as f64;
        let union = query_tokens.union(&memory_tokens).count() as f64;
        shared / union
    }

    fn memory_from_row(row: &MemoryRow) -> Option<Memory> {
        serde_json::from_value(row.payload.clone()).ok()
    }
}

#[async_trait]
impl SemanticRecall for LexicalSemanticRecall {
    async fn store(&self, memory: Memory) -> Result<()> {
        let key = if memory.key.is_empty() {
            new_request_id()
        } else {
            memory.key.clone()
        };
        let row = MemoryRow {
            scope: SEMANTIC_SCOPE.to_string(),
            key,
            owner: memory.owner.clone(),
            payload: serde_json::to_value(&memory)?,
            created_at_unix_ms: current_unix_timestamp_ms(),
            expires_at_unix_ms: None,
        };
        self.store.append(&row)?;
        Ok(())
    }

    async fn recall(&self, query: &str, k: usize) -> Result<Vec<Memory>> {
        let query_tokens = Self::tokenize(query);
        let mut scored: Vec<(f64, Memory)> = self
            .store
            .list_scope(SEMANTIC_SCOPE)?
            .iter()
            .filter_map(Self::memory_from_row)
            .map(|memory| (Self::score(&query_tokens, &memory), memory))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.key.cmp(&b.1.key))
        });
        Ok(scored.into_iter().take(k).map(|(_, memory)| memory).collect())
    }

    async fn delete(&self, key: &str, owner: &str) -> Result<bool> {
        self.store.delete(SEMANTIC_SCOPE, key, owner)
    }
}
