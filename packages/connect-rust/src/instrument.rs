//! Per-call timing and outcome recording through `tracing` spans.
//!
//! Every caller-facing operation runs inside an `info_span!` carrying the
//! component and operation name; `duration_ms` and `outcome` are recorded on
//! the span when the call completes.

use std::future::Future;
use std::time::Instant;

use keyway_core::{KvError, KvResult};
use tracing::{info_span, Instrument};

/// Short outcome label for a finished call.
pub(crate) fn outcome_label<T>(result: &KvResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(KvError::KeyNotFound) => "not_found",
        Err(KvError::KeyAlreadyExists) => "exists",
        Err(KvError::Cancelled) => "cancelled",
        Err(KvError::Timeout { .. }) => "timeout",
        Err(_) => "error",
    }
}

/// Runs `fut` inside an operation span and records its duration and outcome.
pub(crate) async fn observed<F, T>(component: &'static str, op: &'static str, fut: F) -> KvResult<T>
where
    F: Future<Output = KvResult<T>>,
{
    let span = info_span!(
        "kv_operation",
        component,
        op,
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    async move {
        let start = Instant::now();
        let result = fut.await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = outcome_label(&result);

        let current = tracing::Span::current();
        current.record("duration_ms", duration_ms);
        current.record("outcome", outcome);
        tracing::debug!(component, op, duration_ms, outcome, "operation complete");

        result
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok::<_, KvError>(())), "ok");
        assert_eq!(outcome_label::<()>(&Err(KvError::KeyNotFound)), "not_found");
        assert_eq!(outcome_label::<()>(&Err(KvError::KeyAlreadyExists)), "exists");
        assert_eq!(
            outcome_label::<()>(&Err(KvError::Timeout { timeout_ms: 5 })),
            "timeout"
        );
        assert_eq!(outcome_label::<()>(&Err(KvError::NotConnected)), "error");
    }

    #[tokio::test]
    async fn passes_result_through() {
        let out = observed("test", "noop", async { Ok::<_, KvError>(3) }).await;
        assert_eq!(out.unwrap(), 3);

        let err = observed("test", "noop", async { Err::<(), _>(KvError::KeyNotFound) }).await;
        assert!(err.unwrap_err().is_not_found());
    }
}
