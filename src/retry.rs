use std::{future::Future, time::Duration};

use crate::error::{ErrorKind, Result};

/// Runs operations that touch the network, re-attempting transport-classified failures up to a
/// fixed budget with a fixed pause between attempts.
///
/// Anything that is not a transport failure (server-reported errors, timeouts, caller mistakes)
/// propagates immediately; retrying those would at best repeat the same answer and at worst
/// duplicate work the server already did.
#[derive(Clone, Copy, Debug)]
pub struct RetryExecutor {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryExecutor {
    /// An executor giving each operation `max_attempts` tries, `backoff` apart. A zero budget
    /// is corrected to a single attempt so the operation always runs at least once.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        let max_attempts = if max_attempts == 0 {
            tracing::warn!("retry budget of 0 corrected to 1");
            1
        } else {
            max_attempts
        };
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Runs `op` under the retry budget.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with_recovery(op, || async {}).await
    }

    /// Runs `op` under the retry budget; if every attempt fails, runs `recover` (typically
    /// "close and reconnect") before surfacing the failure as a network error.
    pub async fn run_with_recovery<T, F, Fut, R, RFut>(&self, mut op: F, recover: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnOnce() -> RFut,
        RFut: Future<Output = ()>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transport() => {
                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transport failure, will retry"
                    );
                    last_error = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        // max_attempts >= 1, so at least one attempt ran and failed.
        let last_error = last_error.unwrap();
        recover().await;

        Err(ErrorKind::Network {
            message: format!(
                "operation failed after {} attempts: {}",
                self.max_attempts, last_error
            ),
        }
        .into())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use std::time::Duration;

    use super::RetryExecutor;
    use crate::error::{Error, ErrorKind};

    fn transport_error() -> Error {
        Error::connection_closed("test")
    }

    #[tokio::test]
    async fn eventual_success_skips_recovery() {
        let executor = RetryExecutor::new(3, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);
        let recovered = Arc::new(AtomicU32::new(0));

        let recovered_in_op = Arc::clone(&recovered);
        let result = executor
            .run_with_recovery(
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(transport_error())
                        } else {
                            Ok(42)
                        }
                    }
                },
                || async {
                    recovered_in_op.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(recovered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_runs_recovery_and_reports_network_error() {
        let executor = RetryExecutor::new(2, Duration::from_millis(1));
        let recovered = Arc::new(AtomicU32::new(0));

        let recovered_in_op = Arc::clone(&recovered);
        let result: crate::error::Result<()> = executor
            .run_with_recovery(
                || async { Err(transport_error()) },
                || async {
                    recovered_in_op.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::Network { .. }));
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transport_errors_are_not_retried() {
        let executor = RetryExecutor::new(5, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let result: crate::error::Result<()> = executor
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::invalid_argument("bad input")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_budget_still_runs_once() {
        let executor = RetryExecutor::new(0, Duration::from_millis(1));
        let attempts = AtomicU32::new(0);

        let result = executor
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
