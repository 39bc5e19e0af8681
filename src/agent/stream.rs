//! Stream aggregator
//!
//! Consumes a delta stream from a model, concatenates content and counts
//! tokens, and republishes each delta unchanged so downstream can render
//! live or ignore. Token estimation is whitespace-split unless the terminal
//! delta carries authoritative counts.

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ModelError;

use super::types::{Delta, TokenUsage};
use super::AgentEvent;

/// Aggregates one model stream into `{content, est_tokens}`
#[derive(Debug, Default)]
pub struct StreamAggregator {
    content: String,
    est_tokens: u64,
    authoritative: Option<TokenUsage>,
}

impl StreamAggregator {
    /// Fresh aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregated content so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Estimated output token count (whitespace-split)
    pub fn est_tokens(&self) -> u64 {
        self.est_tokens
    }

    /// Usage for the drained stream: authoritative counts when the model
    /// supplied them, otherwise the whitespace estimate as output tokens
    pub fn usage(&self) -> TokenUsage {
        self.authoritative
            .unwrap_or(TokenUsage::new(0, self.est_tokens))
    }

    /// Clear state for a new stream
    pub fn reset(&mut self) {
        self.content.clear();
        self.est_tokens = 0;
        self.authoritative = None;
    }

    /// Drain a delta stream to completion
    ///
    /// Each delta is folded into the aggregate and re-yielded unchanged on
    /// `tee` (when present). Terminates on a `finished` delta or source
    /// close. A source error is converted into one final error-marked delta
    /// on the tee, then reported as `Err`.
    pub async fn drain(
        &mut self,
        source: &mut mpsc::Receiver<Delta>,
        tee: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<(), ModelError> {
        while let Some(delta) = source.recv().await {
            if let Some(text) = &delta.content {
                self.content.push_str(text);
                self.est_tokens += text.split_whitespace().count() as u64;
            }
            if let Some(usage) = delta.usage {
                self.authoritative = Some(usage);
            }

            let error = delta.error.clone();
            let finished = delta.finished;
            if let Some(sink) = tee {
                // A closed tee means the consumer went away; keep draining
                // for the loop's own benefit.
                if sink.send(AgentEvent::Delta(delta)).await.is_err() {
                    warn!("Event sink closed mid-stream; continuing without tee");
                    return self.finish(source, error, finished).await;
                }
            }

            if let Some(message) = error {
                return Err(ModelError::provider(message));
            }
            if finished {
                return Ok(());
            }
        }
        Ok(())
    }

    // Continue draining without a tee after the sink closed.
    async fn finish(
        &mut self,
        source: &mut mpsc::Receiver<Delta>,
        pending_error: Option<String>,
        already_finished: bool,
    ) -> Result<(), ModelError> {
        if let Some(message) = pending_error {
            return Err(ModelError::provider(message));
        }
        if already_finished {
            return Ok(());
        }
        while let Some(delta) = source.recv().await {
            if let Some(text) = &delta.content {
                self.content.push_str(text);
                self.est_tokens += text.split_whitespace().count() as u64;
            }
            if let Some(usage) = delta.usage {
                self.authoritative = Some(usage);
            }
            if let Some(message) = delta.error {
                return Err(ModelError::provider(message));
            }
            if delta.finished {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn feed(deltas: Vec<Delta>) -> mpsc::Receiver<Delta> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for delta in deltas {
                if tx.send(delta).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn aggregates_content_and_estimates_tokens() {
        let mut source = feed(vec![
            Delta::content("The answer "),
            Delta::content("is 4."),
            Delta::finished(),
        ])
        .await;
        let mut agg = StreamAggregator::new();
        agg.drain(&mut source, None).await.unwrap();
        assert_eq!(agg.content(), "The answer is 4.");
        assert_eq!(agg.est_tokens(), 4);
        assert_eq!(agg.usage(), TokenUsage::new(0, 4));
    }

    #[tokio::test]
    async fn authoritative_usage_wins_over_estimate() {
        let mut source = feed(vec![
            Delta::content("hello world"),
            Delta::finished_with_usage(TokenUsage::new(50, 7)),
        ])
        .await;
        let mut agg = StreamAggregator::new();
        agg.drain(&mut source, None).await.unwrap();
        assert_eq!(agg.usage(), TokenUsage::new(50, 7));
    }

    #[tokio::test]
    async fn republishes_deltas_unchanged() {
        let mut source = feed(vec![
            Delta::content("a"),
            Delta::content("b"),
            Delta::finished(),
        ])
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut agg = StreamAggregator::new();
        agg.drain(&mut source, Some(&tx)).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Delta(d) = event {
                seen.push(d);
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].content.as_deref(), Some("a"));
        assert!(seen[2].finished);
    }

    #[tokio::test]
    async fn error_delta_is_forwarded_then_reported() {
        let mut source = feed(vec![
            Delta::content("partial"),
            Delta::error("provider exploded"),
        ])
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut agg = StreamAggregator::new();
        let err = agg.drain(&mut source, Some(&tx)).await.unwrap_err();
        assert!(err.message.contains("provider exploded"));
        drop(tx);

        let mut last = None;
        while let Some(AgentEvent::Delta(d)) = rx.recv().await {
            last = Some(d);
        }
        assert!(last.unwrap().error.is_some());
        // Partial content is still retained for the step record.
        assert_eq!(agg.content(), "partial");
    }

    #[tokio::test]
    async fn source_close_without_finished_terminates() {
        let mut source = feed(vec![Delta::content("x")]).await;
        let mut agg = StreamAggregator::new();
        agg.drain(&mut source, None).await.unwrap();
        assert_eq!(agg.content(), "x");
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let mut agg = StreamAggregator::new();
        let mut source = feed(vec![Delta::content("one two"), Delta::finished()]).await;
        agg.drain(&mut source, None).await.unwrap();
        agg.reset();
        assert_eq!(agg.content(), "");
        assert_eq!(agg.est_tokens(), 0);
    }
}
