//! Verdict Aggregator
//!
//! Fans one message out to every enabled module and folds the results into
//! a [`Verdict`].

use super::{apply_groups, decide, Verdict};
use crate::metrics::Metrics;
use crate::modules::{CheckContext, MessageCheckResult, ModuleRegistry};
use futures::FutureExt;
use mailsift_common::{Action, Config};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Verdict Aggregator
pub struct Aggregator {
    modules: Arc<ModuleRegistry>,
    metrics: Arc<Metrics>,
}

impl Aggregator {
    pub fn new(modules: Arc<ModuleRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { modules, metrics }
    }

    /// Run every enabled module against a message and decide.
    ///
    /// Each check runs in its own task. A check that fails, panics or
    /// exceeds `milter.module_timeout_ms` yields an Error result carrying
    /// `scoring.error_score`. Once one bucket's raw score reaches
    /// `scoring.breaker_threshold` the remaining checks are cancelled and
    /// their results discarded. Returns after every check task has ended.
    pub async fn evaluate(&self, ctx: CheckContext, config: &Config) -> Verdict {
        let scoring = &config.scoring;
        let modules = self.modules.enabled();
        if modules.is_empty() {
            return decide(Vec::new(), scoring);
        }

        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let timeout = Duration::from_millis(config.milter.module_timeout_ms);
        let error_score = scoring.error_score;

        let (tx, mut rx) = mpsc::channel::<(usize, Option<MessageCheckResult>)>(modules.len());
        let mut producers = JoinSet::new();

        for (index, module) in modules.into_iter().enumerate() {
            let tx = tx.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();

            producers.spawn(async move {
                let name = module.name().to_string();
                let started = Instant::now();

                let check = AssertUnwindSafe(module.message_check(&ctx, &cancel)).catch_unwind();
                let result = match tokio::time::timeout(timeout, check).await {
                    Ok(Ok(Ok(result))) => result,
                    Ok(Ok(Err(e))) => {
                        warn!(module = %name, "Module check failed: {:#}", e);
                        Some(MessageCheckResult::error(&name, e.to_string(), error_score))
                    }
                    Ok(Err(panic)) => {
                        let reason = panic_message(panic.as_ref());
                        error!(module = %name, "Module check panicked: {}", reason);
                        Some(MessageCheckResult::error(&name, reason, error_score))
                    }
                    Err(_) => {
                        warn!(module = %name, timeout_ms = timeout.as_millis() as u64, "Module check timed out");
                        Some(MessageCheckResult::error(&name, "timed out", error_score))
                    }
                };

                let result = result.map(|mut r| {
                    r.module = name;
                    r.duration = started.elapsed();
                    r
                });

                // Capacity matches the number of producers, so this never waits
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut collected: Vec<(usize, MessageCheckResult)> = Vec::new();
        let mut breaker = [0.0_f64; 4];
        let mut tripped = false;
        let mut discarded = 0usize;

        // Ends once every producer has sent or gone away
        while let Some((index, result)) = rx.recv().await {
            let Some(mut result) = result else {
                continue;
            };

            self.metrics
                .module_duration
                .with_label_values(&[result.module.as_str()])
                .observe(result.duration.as_secs_f64());
            if result.action == Action::Error {
                self.metrics
                    .module_errors
                    .with_label_values(&[result.module.as_str()])
                    .inc();
            }

            if tripped {
                discarded += 1;
                continue;
            }

            result.normalize();
            debug!(
                module = %result.module,
                action = %result.action,
                score = result.score,
                "Module result received"
            );

            let bucket = result.action.index();
            breaker[bucket] += result.score;
            let breaks =
                scoring.breaker_threshold > 0.0 && breaker[bucket] >= scoring.breaker_threshold;
            collected.push((index, result));

            if breaks {
                info!(
                    bucket = Action::ALL[bucket].as_str(),
                    score = breaker[bucket],
                    threshold = scoring.breaker_threshold,
                    "Breaker threshold reached, cancelling remaining checks"
                );
                tripped = true;
                cancel.cancel();
            }
        }

        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                error!("Module check task failed: {}", e);
            }
        }

        if discarded > 0 {
            debug!(discarded, "Discarded results received after the breaker tripped");
        }

        collected.sort_by_key(|(index, _)| *index);
        let mut results: Vec<MessageCheckResult> = collected.into_iter().map(|(_, r)| r).collect();
        apply_groups(&mut results, &scoring.groups);

        let mut verdict = decide(results, scoring);
        verdict.breaker_tripped = tripped;
        verdict
    }

    /// Spawn every post-verdict callback with the final action.
    ///
    /// Each callback runs in its own task; failures and panics are logged.
    pub fn run_callbacks(&self, verdict: &Verdict, action: Action) {
        for result in &verdict.results {
            for callback in &result.callbacks {
                let module = result.module.clone();
                let callback = callback.clone();
                let future = AssertUnwindSafe(async move { callback(action).await }).catch_unwind();

                tokio::spawn(async move {
                    match future.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(module = %module, "Post-verdict callback failed: {:#}", e),
                        Err(panic) => error!(
                            module = %module,
                            "Post-verdict callback panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    }
                });
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
