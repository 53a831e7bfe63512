//! Accumulates provider deltas into a growing reply, honoring cancellation.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::llm_client::{DeltaStream, ProviderError};

/// Why a delta sequence stopped.
#[derive(Debug, Clone)]
pub enum AggregateOutcome {
    Completed,
    Cancelled,
    Failed(ProviderError),
}

impl AggregateOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AggregateOutcome::Completed => "completed",
            AggregateOutcome::Cancelled => "cancelled",
            AggregateOutcome::Failed(_) => "failed",
        }
    }
}

/// One accepted delta together with the reply accumulated so far.
#[derive(Debug)]
pub struct AcceptedDelta<'a> {
    pub delta: String,
    pub full_content: &'a str,
}

/// Final state once the sequence has ended.
#[derive(Debug)]
pub struct AggregateResult {
    pub content: String,
    pub outcome: AggregateOutcome,
    pub accepted: usize,
}

/// Pulls deltas from a provider stream until it ends, fails, or is cancelled.
///
/// Cancellation is observed before every pull, so no delta is accepted once
/// the token fires. Empty deltas are dropped.
pub struct TokenAggregator {
    deltas: DeltaStream,
    cancel: CancellationToken,
    full_content: String,
    accepted: usize,
    outcome: Option<AggregateOutcome>,
}

impl TokenAggregator {
    pub fn new(deltas: DeltaStream, cancel: CancellationToken) -> Self {
        Self {
            deltas,
            cancel,
            full_content: String::new(),
            accepted: 0,
            outcome: None,
        }
    }

    /// Next accepted delta, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<AcceptedDelta<'_>> {
        loop {
            if self.outcome.is_some() {
                return None;
            }

            let pulled = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                item = self.deltas.next() => Some(item),
            };

            match pulled {
                None => {
                    self.outcome = Some(AggregateOutcome::Cancelled);
                }
                Some(None) => {
                    self.outcome = Some(AggregateOutcome::Completed);
                }
                Some(Some(Err(err))) => {
                    self.outcome = Some(AggregateOutcome::Failed(err));
                }
                Some(Some(Ok(delta))) if delta.is_empty() => {}
                Some(Some(Ok(delta))) => {
                    self.full_content.push_str(&delta);
                    self.accepted += 1;
                    return Some(AcceptedDelta {
                        delta,
                        full_content: &self.full_content,
                    });
                }
            }
        }
    }

    /// Consume the aggregator. A sequence abandoned before it ended counts as cancelled.
    #[must_use]
    pub fn finish(self) -> AggregateResult {
        AggregateResult {
            content: self.full_content,
            outcome: self.outcome.unwrap_or(AggregateOutcome::Cancelled),
            accepted: self.accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::testing::ScriptedClient;
    use crate::llm_client::LlmClient;
    use crate::models::Message;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    async fn stream_of(client: &ScriptedClient) -> DeltaStream {
        client
            .stream_completion(&[Message::human("hi")])
            .await
            .ok()
            .unwrap()
    }

    #[tokio::test]
    async fn accumulates_and_skips_empty_deltas() {
        let client = ScriptedClient::new(["Hel", "", "lo"]);
        let mut agg = TokenAggregator::new(stream_of(&client).await, CancellationToken::new());

        let mut seen = Vec::new();
        while let Some(step) = agg.next().await {
            seen.push((step.delta, step.full_content.to_string()));
        }
        assert_eq!(
            seen,
            vec![
                ("Hel".to_string(), "Hel".to_string()),
                ("lo".to_string(), "Hello".to_string()),
            ]
        );
        assert!(agg.next().await.is_none());

        let result = agg.finish();
        assert_eq!(result.content, "Hello");
        assert_eq!(result.accepted, 2);
        assert!(matches!(result.outcome, AggregateOutcome::Completed));
    }

    #[tokio::test]
    async fn provider_failure_keeps_partial_content() {
        let client = ScriptedClient::new(["par", "tial"])
            .failing_after(ProviderError::NetworkError("reset".to_string()));
        let mut agg = TokenAggregator::new(stream_of(&client).await, CancellationToken::new());
        while agg.next().await.is_some() {}
        let result = agg.finish();
        assert_eq!(result.content, "partial");
        assert!(matches!(result.outcome, AggregateOutcome::Failed(ProviderError::NetworkError(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_delta() {
        let gate = Arc::new(Semaphore::new(1));
        let client = ScriptedClient::new(["a", "b", "c"]).gated(Arc::clone(&gate));
        let cancel = CancellationToken::new();
        let mut agg = TokenAggregator::new(stream_of(&client).await, cancel.clone());

        let first = agg.next().await.map(|step| step.delta);
        assert_eq!(first.as_deref(), Some("a"));

        cancel.cancel();
        gate.add_permits(2);
        assert!(agg.next().await.is_none());

        let result = agg.finish();
        assert_eq!(result.content, "a");
        assert!(matches!(result.outcome, AggregateOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_before_start_accepts_nothing() {
        let client = ScriptedClient::new(["a", "b"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut agg = TokenAggregator::new(stream_of(&client).await, cancel);
        assert!(agg.next().await.is_none());
        let result = agg.finish();
        assert_eq!(result.content, "");
        assert_eq!(result.outcome.label(), "cancelled");
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_provider() {
        let client = ScriptedClient::new(["x"]).hanging();
        let cancel = CancellationToken::new();
        let mut agg = TokenAggregator::new(stream_of(&client).await, cancel.clone());
        assert!(agg.next().await.is_some());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert!(agg.next().await.is_none());
        assert!(matches!(agg.finish().outcome, AggregateOutcome::Cancelled));
    }
}
