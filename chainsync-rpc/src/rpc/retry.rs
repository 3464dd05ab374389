//! Retry logic for node requests.
//!
//! Transport level failures, gateway errors and a node still warming up are retried with
//! exponential backoff. Anything else, including "not found" answers, fails immediately.
use std::{future::Future, time::Duration};

use backoff::{exponential::ExponentialBackoffBuilder, ExponentialBackoff};
use tracing::debug;

use super::config::RPCRetryConfig;
use crate::{RPCError, RPC_IN_WARMUP};

#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_retries: usize,
}

impl From<&RPCRetryConfig> for RetryPolicy {
    fn from(config: &RPCRetryConfig) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_millis(config.max_backoff_ms))
            // attempts are bounded by `max_retries` instead
            .with_max_elapsed_time(None)
            .build();
        Self { backoff, max_retries: config.max_retries }
    }
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds, fails permanently or `max_retries` retries are used up.
    pub(crate) async fn retry_request<F, Fut, T>(&self, mut operation: F) -> Result<T, RPCError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RPCError>>,
    {
        let mut attempt = 0usize;
        let max_retries = self.max_retries;
        backoff::future::retry(self.backoff.clone(), || {
            attempt += 1;
            let exhausted = attempt > max_retries;
            let fut = operation();
            async move {
                fut.await.map_err(|err| {
                    if exhausted || !is_retryable(&err) {
                        backoff::Error::permanent(err)
                    } else {
                        debug!(attempt, error = %err, "Retrying node request");
                        backoff::Error::transient(err)
                    }
                })
            }
        })
        .await
    }
}

pub(crate) fn is_retryable(err: &RPCError) -> bool {
    match err {
        RPCError::RequestError(_, source) => source.is_connect() || source.is_timeout(),
        RPCError::ServerUnreachable(_) => true,
        RPCError::NodeError { code, .. } => *code == RPC_IN_WARMUP,
        RPCError::SetupError(_) | RPCError::ParseError(_) => false,
    }
}
