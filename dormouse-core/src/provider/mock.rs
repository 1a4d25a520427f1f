//! Offline provider for tests.
//!
//! Embeddings are hashed bags of words, so texts sharing words land close
//! together and the same text always maps to the same vector.

use super::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct CancelTrigger {
    marker: String,
    token: CancellationToken,
    /// Never answer the triggering call.
    stall: bool,
}

pub struct MockProvider {
    dim: usize,
    answer: String,
    fail_marker: Option<String>,
    cancel_trigger: Option<CancelTrigger>,
    embed_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockProvider {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            answer: "This is a mock answer.".to_string(),
            fail_marker: None,
            cancel_trigger: None,
            embed_calls: AtomicUsize::new(0),
            chat_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    /// Makes `embed` fail for any batch containing `marker`.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Cancels `token` while embedding a batch containing `marker`; that batch
    /// is still answered.
    pub fn cancelling_on(mut self, marker: impl Into<String>, token: CancellationToken) -> Self {
        self.cancel_trigger = Some(CancelTrigger {
            marker: marker.into(),
            token,
            stall: false,
        });
        self
    }

    /// Cancels `token` while embedding a batch containing `marker` and leaves
    /// that call pending forever.
    pub fn stalling_on(mut self, marker: impl Into<String>, token: CancellationToken) -> Self {
        self.cancel_trigger = Some(CancelTrigger {
            marker: marker.into(),
            token,
            stall: true,
        });
        self
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().ok().and_then(|guard| guard.clone())
    }

    /// Deterministic embedding of `text`.
    pub fn embedding_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim.max(1)];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let slot = (fnv1a(word.as_bytes()) % vector.len() as u64) as usize;
            vector[slot] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector.truncate(self.dim);
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Provider for MockProvider {
    async fn chat<'a>(
        &'a self,
        request: ChatRequest,
        mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
    ) -> Result<()> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let model = request.model.clone();
        let stream = request.stream;
        if let Ok(mut guard) = self.last_request.lock() {
            *guard = Some(request);
        }

        if !stream {
            callback(ChatResponse {
                model,
                content: self.answer.clone(),
                done: true,
            });
            return Ok(());
        }

        for fragment in self.answer.split_inclusive(' ') {
            callback(ChatResponse {
                model: model.clone(),
                content: fragment.to_string(),
                done: false,
            });
        }
        callback(ChatResponse {
            model,
            content: String::new(),
            done: true,
        });
        Ok(())
    }

    async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if texts.iter().any(|text| text.contains(marker.as_str())) {
                return Err(ProviderError::Api {
                    status: 500,
                    message: format!("mock failure on '{marker}'"),
                });
            }
        }
        if let Some(trigger) = &self.cancel_trigger {
            if texts.iter().any(|text| text.contains(trigger.marker.as_str())) {
                trigger.token.cancel();
                if trigger.stall {
                    std::future::pending::<()>().await;
                }
            }
        }
        Ok(texts.iter().map(|text| self.embedding_for(text)).collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
