//! Drives a job's items through the pipeline, one at a time.

use crate::config::RetryPolicy;
use crate::control::{JobControl, WaitOutcome};
use crate::driver::{CapabilityDriver, Step};
use crate::events::{EventSink, JobSummary};
use crate::models::{ContextId, ItemId};
use crate::pipeline::{AttemptResult, ItemPipeline, StepReport, describe_timings};
use crate::store::IdempotencyStore;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub context: ContextId,
    pub items: Vec<ItemId>,
    pub skip_completed: bool,
}

impl Job {
    pub fn new(context: ContextId, items: Vec<ItemId>, skip_completed: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            items,
            skip_completed,
        }
    }
}

/// Terminal state of one item within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Skipped,
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Aborted,
    SessionLost(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    pipeline: ItemPipeline,
    store: IdempotencyStore,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(pipeline: ItemPipeline, store: IdempotencyStore, policy: RetryPolicy) -> Self {
        Self {
            pipeline,
            store,
            policy,
        }
    }

    pub fn run_job(
        &self,
        driver: &mut dyn CapabilityDriver,
        job: &Job,
        control: &JobControl,
        events: &EventSink,
    ) -> JobSummary {
        let total = job.items.len();
        let mut summary = JobSummary::new(total);
        events.started();
        events.log(format!(
            "Starting {total} item(s) for context {}",
            job.context
        ));

        for (index, item) in job.items.iter().enumerate() {
            if control.is_aborted() {
                summary.aborted = true;
                break;
            }
            match self.process_item(driver, job, item, control, events) {
                ItemOutcome::Skipped => {
                    crate::metrics::item_finished("skipped");
                    summary.skipped.push(item.clone());
                }
                ItemOutcome::Succeeded { attempts } => {
                    crate::metrics::item_finished("succeeded");
                    info!(
                        target = "reupload.worker",
                        context_id = %job.context,
                        item_id = %item,
                        attempt = attempts,
                        "item completed"
                    );
                    summary.succeeded.push(item.clone());
                }
                ItemOutcome::Exhausted { attempts } => {
                    crate::metrics::item_finished("exhausted");
                    events.log(format!("{item}: giving up after {attempts} attempt(s)"));
                    summary.failed.push(item.clone());
                }
                ItemOutcome::Aborted => {
                    summary.aborted = true;
                    break;
                }
                ItemOutcome::SessionLost(detail) => {
                    events.log(format!("{item}: browser session lost: {detail}"));
                    summary.fatal = Some(detail);
                    break;
                }
            }
            events.progress(index + 1, total);
        }

        if summary.aborted {
            events.log("Stopped by operator");
        }
        events.log(format!(
            "Finished: {} done, {} skipped, {} failed",
            summary.succeeded.len(),
            summary.skipped.len(),
            summary.failed.len()
        ));
        events.finished(summary.clone());
        summary
    }

    fn process_item(
        &self,
        driver: &mut dyn CapabilityDriver,
        job: &Job,
        item: &ItemId,
        control: &JobControl,
        events: &EventSink,
    ) -> ItemOutcome {
        if job.skip_completed && self.already_completed(&job.context, item) {
            events.log(format!("{item}: already processed, skipping"));
            return ItemOutcome::Skipped;
        }

        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;
        let mut pauses = 0;
        loop {
            events.log(format!("{item}: attempt {attempt}/{max_attempts}"));
            match self.pipeline.run_attempt(driver, &job.context, item) {
                AttemptResult::Succeeded { steps } => {
                    self.record(&job.context, item, &steps, events);
                    return ItemOutcome::Succeeded { attempts: attempt };
                }
                AttemptResult::Failed { step, detail } => {
                    events.log(format!("{item}: {step} failed: {detail}"));
                    if attempt >= max_attempts {
                        return ItemOutcome::Exhausted { attempts: attempt };
                    }
                    events.log(format!(
                        "{item}: retrying in {}s",
                        self.policy.retry_delay.as_secs_f32()
                    ));
                    match control.sleep(self.policy.retry_delay, self.policy.poll_interval) {
                        WaitOutcome::Aborted => return ItemOutcome::Aborted,
                        WaitOutcome::Completed => attempt += 1,
                    }
                }
                AttemptResult::Interrupted { after } => {
                    pauses += 1;
                    if pauses > self.policy.max_pauses_per_item {
                        warn!(
                            target = "reupload.worker",
                            context_id = %job.context,
                            item_id = %item,
                            pauses = pauses - 1,
                            "pause limit reached"
                        );
                        events.log(format!(
                            "{item}: challenge keeps reappearing, leaving the item"
                        ));
                        return ItemOutcome::Exhausted { attempts: attempt };
                    }
                    if self.pause(item, after, control, events) == WaitOutcome::Aborted {
                        return ItemOutcome::Aborted;
                    }
                }
                AttemptResult::SessionLost { detail, .. } => {
                    return ItemOutcome::SessionLost(detail);
                }
            }
        }
    }

    /// A failed lookup is treated as "not completed"; processing twice is
    /// preferable to silently skipping.
    fn already_completed(&self, context: &ContextId, item: &ItemId) -> bool {
        match self.store.is_completed(context, item) {
            Ok(done) => done,
            Err(err) => {
                warn!(
                    target = "reupload.store",
                    context_id = %context,
                    item_id = %item,
                    error = %err,
                    "completion lookup failed"
                );
                false
            }
        }
    }

    fn record(
        &self,
        context: &ContextId,
        item: &ItemId,
        steps: &[StepReport],
        events: &EventSink,
    ) {
        let elapsed_ms: u64 = steps.iter().map(|report| report.elapsed_ms).sum();
        info!(
            target = "reupload.worker",
            context_id = %context,
            item_id = %item,
            elapsed_ms,
            "steps: {}",
            describe_timings(steps)
        );
        match self.store.record_completion(context, item) {
            Ok(()) => events.log(format!(
                "{item}: image replaced in {elapsed_ms}ms ({})",
                describe_timings(steps)
            )),
            Err(err) => {
                warn!(
                    target = "reupload.store",
                    context_id = %context,
                    item_id = %item,
                    error = %err,
                    "completion not recorded"
                );
                events.log(format!("{item}: image replaced, but not recorded: {err}"));
            }
        }
    }

    fn pause(
        &self,
        item: &ItemId,
        after: Option<Step>,
        control: &JobControl,
        events: &EventSink,
    ) -> WaitOutcome {
        control.arm_pause();
        let at = after.map(Step::name).unwrap_or("start");
        events.paused(format!(
            "Captcha on item {item} (after {at}). Solve it in the browser window, then resume."
        ));
        let outcome = control.wait_for_resume(self.policy.poll_interval);
        if outcome == WaitOutcome::Completed {
            events.resumed();
            events.log(format!("{item}: resumed, restarting the attempt"));
        }
        outcome
    }
}
