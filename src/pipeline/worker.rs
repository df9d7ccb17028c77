//! Worker pool: turn dispatched units into exactly one [`UnitResult`] each.
//!
//! ## Retry Strategy
//!
//! Rate limits, service errors and timeouts are transient under concurrent
//! load. A unit gets at most `max_retries` calls; after the i-th failed call
//! (0-based) the worker sleeps `base * 2^i` before the next one, and never
//! after the last. With the 30 s default base and 5 calls the waits are
//! 30 s → 60 s → 120 s → 240 s. A `retry_after` hint longer than the backoff
//! wins. A response that fails to parse is final: parsing is deterministic,
//! so calling again would only repeat the bill.
//!
//! A [`CallError::Rejected`] call (bad credentials, unknown model) is not a
//! unit failure at all: every unit would be refused the same way, so the
//! worker returns [`ExtractError::InferenceRejected`] and the run stops.
//!
//! ## Concurrency
//!
//! [`run_pool`] drives `W` units at once with `buffer_unordered`, pulling
//! from the producer's channel only when a slot frees up. The pool ends
//! when the channel is closed and every in-flight unit has finished.

use crate::config::RetryPolicy;
use crate::error::{CallError, ExtractError, FailureReason};
use crate::pipeline::llm::InferenceClient;
use crate::pipeline::parse::ResponseParser;
use crate::pipeline::producer::Dispatch;
use crate::progress::ProgressCallback;
use crate::unit::{Record, UnitKey, UnitResult, UnitStatus, WorkUnit};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

/// Processes one unit at a time; shared by every slot of the pool.
pub struct Worker {
    client: Arc<dyn InferenceClient>,
    parser: Arc<dyn ResponseParser>,
    policy: RetryPolicy,
    progress: Option<ProgressCallback>,
}

impl Worker {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        parser: Arc<dyn ResponseParser>,
        policy: RetryPolicy,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            client,
            parser,
            policy,
            progress,
        }
    }

    /// Process one dispatched item.
    ///
    /// Every per-unit outcome is an `Ok` result; `Err` only when the
    /// provider rejected the call outright.
    pub async fn process(&self, item: Dispatch) -> Result<UnitResult, ExtractError> {
        let result = match item {
            Dispatch::Unit(unit) => self.process_unit(unit).await?,
            Dispatch::RenderFailed { key, error } => UnitResult::failed(
                key,
                FailureReason::RenderFailed {
                    detail: error.detail,
                },
                0,
                0,
            ),
        };

        if let Some(ref cb) = self.progress {
            match &result.status {
                UnitStatus::Success => cb.on_unit_complete(result.key, result.records.len()),
                UnitStatus::Failed(reason) => cb.on_unit_failed(result.key, reason),
            }
        }
        Ok(result)
    }

    async fn process_unit(&self, unit: WorkUnit) -> Result<UnitResult, ExtractError> {
        let start = Instant::now();
        let key = unit.key;
        let max_calls = self.policy.max_retries.max(1);

        if let Some(ref cb) = self.progress {
            cb.on_unit_start(key);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = match timeout(
                self.policy.call_timeout,
                self.client.call(&unit.payload, &unit.instruction),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(CallError::Timeout(self.policy.call_timeout)),
            };

            let error = match outcome {
                Ok(text) => return Ok(self.finish(key, &text, attempt, start)),
                Err(CallError::Rejected(detail)) => {
                    error!("{}: provider rejected the call: {}", key, detail);
                    return Err(ExtractError::InferenceRejected { key, detail });
                }
                Err(e) => e,
            };

            if attempt >= max_calls {
                warn!("{}: giving up after {} attempts ({})", key, attempt, error);
                return Ok(UnitResult::failed(
                    key,
                    exhausted(&error, attempt),
                    attempt,
                    elapsed_ms(start),
                ));
            }

            let mut wait = self.policy.backoff(attempt - 1);
            if let CallError::RateLimited {
                retry_after: Some(hint),
            } = &error
            {
                wait = wait.max(*hint);
            }

            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {:?}",
                key, attempt, max_calls, error, wait
            );
            if let Some(ref cb) = self.progress {
                cb.on_retry(key, attempt, wait, &error.to_string());
            }
            sleep(wait).await;
        }
    }

    fn finish(&self, key: UnitKey, text: &str, attempts: u32, start: Instant) -> UnitResult {
        match self.parser.parse(text) {
            Ok(values) => {
                let records: Vec<Record> = values
                    .into_iter()
                    .enumerate()
                    .map(|(index, mut value)| {
                        stamp_page(&mut value, key);
                        Record { key, index, value }
                    })
                    .collect();
                debug!("{}: {} records after {} attempt(s)", key, records.len(), attempts);
                UnitResult {
                    key,
                    records,
                    status: UnitStatus::Success,
                    attempts,
                    duration_ms: elapsed_ms(start),
                }
            }
            Err(malformed) => {
                warn!("{}: {}", key, malformed);
                UnitResult::failed(
                    key,
                    FailureReason::Malformed {
                        detail: malformed.0,
                    },
                    attempts,
                    elapsed_ms(start),
                )
            }
        }
    }
}

/// Record the source page on object records that don't carry one.
fn stamp_page(value: &mut Value, key: UnitKey) {
    if let Value::Object(map) = value {
        map.entry("page_number").or_insert(Value::from(key.page));
    }
}

fn exhausted(last: &CallError, attempts: u32) -> FailureReason {
    match last {
        CallError::RateLimited { .. } => FailureReason::RateLimitedExhausted { attempts },
        CallError::Timeout(_) => FailureReason::TimeoutExhausted { attempts },
        CallError::ServiceError(detail) | CallError::Rejected(detail) => {
            FailureReason::ServiceErrorExhausted {
                attempts,
                detail: detail.clone(),
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Run `workers` units concurrently over the producer's channel.
pub fn run_pool(
    worker: &Worker,
    rx: mpsc::Receiver<Dispatch>,
    workers: usize,
) -> impl Stream<Item = Result<UnitResult, ExtractError>> + '_ {
    ReceiverStream::new(rx)
        .map(move |item| worker.process(item))
        .buffer_unordered(workers.max(1))
}
