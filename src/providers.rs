//! Collaborator seams: completion, search, and external review artifacts.
//!
//! The surrounding application supplies real implementations (LLM
//! provider, vector search, review vendor). This core only depends on the
//! three narrow traits below. Transient failures are absorbed here:
//! [`retry_complete`] retries with backoff a bounded number of times and
//! then falls back to a deterministic stub so the state machine always
//! makes forward progress instead of propagating provider outages.

use async_trait::async_trait;
use miette::Diagnostic;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(runloom::provider::call))]
    Call {
        provider: &'static str,
        message: String,
    },
}

/// One message in a completion request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Completion result with usage as reported by the provider, if any.
#[derive(Clone, Debug, Default)]
pub struct CompletionOutput {
    pub text: String,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Text-completion seam: a message list in, a string (or failure) out.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionOutput, ProviderError>;
}

/// Ranked snippet returned by the search seam.
#[derive(Clone, Debug, PartialEq)]
pub struct Snippet {
    pub text: String,
    pub source: String,
    pub score: f64,
}

/// Similarity/keyword search over short text chunks, plus the live-search
/// escape hatch and index upsert the Act/Expand steps use.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Query the existing index.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Snippet>, ProviderError>;

    /// Issue a live (external) search when the index has nothing.
    async fn live_search(&self, text: &str, limit: usize) -> Result<Vec<Snippet>, ProviderError>;

    /// Add chunks to the index for later queries.
    async fn upsert(&self, snippets: &[Snippet]) -> Result<(), ProviderError>;
}

/// Reference to an externally created review artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactRef {
    pub artifact_id: String,
}

/// External review vendor seam used by the Turnitin handoff.
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    async fn create_artifact(
        &self,
        run_id: &str,
        title: &str,
    ) -> Result<ArtifactRef, ProviderError>;
}

/// Run `op` with bounded attempts and exponential sleeps; on exhaustion
/// return the deterministic `fallback` instead of an error.
pub async fn retry_complete(
    provider: &dyn Completion,
    messages: &[ChatMessage],
    attempts: u32,
    fallback: impl FnOnce() -> CompletionOutput,
) -> CompletionOutput {
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        match provider.complete(messages).await {
            Ok(out) => return out,
            Err(e) => {
                warn!(attempt, error = %e, "completion attempt failed");
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
                }
            }
        }
    }
    fallback()
}

/// Tokens-consumed floor when the provider reports no usage:
/// roughly 4/3 tokens per whitespace-separated word.
pub fn token_floor(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    words.saturating_mul(4).div_ceil(3)
}

/// Deterministic offline completion. Cycles through canned responses;
/// doubles as the transient-failure fallback target.
#[derive(Default)]
pub struct StaticCompletion {
    responses: Vec<String>,
    cursor: Mutex<usize>,
}

impl StaticCompletion {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: Mutex::new(0),
        }
    }

    pub fn single(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl Completion for StaticCompletion {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<CompletionOutput, ProviderError> {
        let text = if self.responses.is_empty() {
            String::new()
        } else {
            let mut cursor = self
                .cursor
                .lock()
                .map_err(|_| ProviderError::Call {
                    provider: "static",
                    message: "cursor poisoned".into(),
                })?;
            let text = self.responses[*cursor % self.responses.len()].clone();
            *cursor += 1;
            text
        };
        Ok(CompletionOutput {
            text,
            tokens: None,
            cost_usd: None,
        })
    }
}

/// In-memory search index with a fixed live-search result set.
#[derive(Default)]
pub struct MemorySearchIndex {
    index: Mutex<Vec<Snippet>>,
    live: Vec<Snippet>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index that answers live searches with the given snippets.
    pub fn with_live_results(live: Vec<Snippet>) -> Self {
        Self {
            index: Mutex::new(Vec::new()),
            live,
        }
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, Vec<Snippet>>, ProviderError> {
        self.index.lock().map_err(|_| ProviderError::Call {
            provider: "memory-search",
            message: "index poisoned".into(),
        })
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Snippet>, ProviderError> {
        let needle = text.to_ascii_lowercase();
        let index = self.lock_index()?;
        Ok(index
            .iter()
            .filter(|s| {
                needle
                    .split_whitespace()
                    .any(|w| s.text.to_ascii_lowercase().contains(w))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn live_search(&self, _text: &str, limit: usize) -> Result<Vec<Snippet>, ProviderError> {
        Ok(self.live.iter().take(limit).cloned().collect())
    }

    async fn upsert(&self, snippets: &[Snippet]) -> Result<(), ProviderError> {
        let mut index = self.lock_index()?;
        for snippet in snippets {
            if let Some(existing) = index.iter_mut().find(|s| s.source == snippet.source) {
                *existing = snippet.clone();
            } else {
                index.push(snippet.clone());
            }
        }
        Ok(())
    }
}

/// Artifact client that mints local ids without touching any vendor.
#[derive(Default)]
pub struct NullArtifactClient;

#[async_trait]
impl ArtifactClient for NullArtifactClient {
    async fn create_artifact(
        &self,
        _run_id: &str,
        _title: &str,
    ) -> Result<ArtifactRef, ProviderError> {
        Ok(ArtifactRef {
            artifact_id: format!("local-{}", uuid::Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingCompletion {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Completion for FailingCompletion {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
        ) -> Result<CompletionOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Call {
                provider: "test",
                message: "down".into(),
            })
        }
    }

    #[tokio::test]
    async fn retry_falls_back_after_bounded_attempts() {
        let provider = FailingCompletion {
            calls: AtomicU32::new(0),
        };
        let out = retry_complete(&provider, &[], 3, || CompletionOutput {
            text: "fallback".into(),
            ..Default::default()
        })
        .await;
        assert_eq!(out.text, "fallback");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn token_floor_rounds_up() {
        assert_eq!(token_floor(""), 0);
        assert_eq!(token_floor("one two three"), 4);
    }

    #[tokio::test]
    async fn memory_index_upsert_then_query() {
        let index = MemorySearchIndex::new();
        index
            .upsert(&[Snippet {
                text: "coral bleaching events".into(),
                source: "doc-1".into(),
                score: 0.9,
            }])
            .await
            .unwrap();
        let hits = index.query("bleaching", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(index.query("unrelated", 5).await.unwrap().is_empty());
    }
}
