//! One attempt at replacing the image of one item.
//!
//! The step order is fixed: navigate, wait for previews, open the gallery,
//! read the latest image source, download it, submit it back through the
//! upload input, then confirm and save. The first failing step ends the
//! attempt; retries belong to the orchestrator.

use crate::driver::{CapabilityDriver, DriverError, Step};
use crate::models::{ContextId, ItemId};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: Step,
    pub elapsed_ms: u64,
}

impl StepReport {
    fn new(step: Step, elapsed_ms: u128) -> Self {
        Self {
            step,
            elapsed_ms: elapsed_ms as u64,
        }
    }
}

/// Renders step timings as `navigate 12ms, wait_for_previews 340ms, ...`.
pub fn describe_timings(steps: &[StepReport]) -> String {
    steps
        .iter()
        .map(|report| format!("{} {}ms", report.step, report.elapsed_ms))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Succeeded { steps: Vec<StepReport> },
    Failed { step: Step, detail: String },
    /// A challenge page is showing. `after` is the step that preceded it,
    /// `None` when it was already there before the attempt began.
    Interrupted { after: Option<Step> },
    SessionLost { step: Option<Step>, detail: String },
}

#[derive(Debug, Clone)]
pub struct ItemPipeline {
    preview_timeout: Duration,
}

impl ItemPipeline {
    pub fn new(preview_timeout: Duration) -> Self {
        Self { preview_timeout }
    }

    pub fn run_attempt(
        &self,
        driver: &mut dyn CapabilityDriver,
        context: &ContextId,
        item: &ItemId,
    ) -> AttemptResult {
        let mut steps = Vec::with_capacity(Step::ALL.len());
        match self.execute(driver, context, item, &mut steps) {
            Ok(()) => {
                debug!(
                    target = "reupload.pipeline",
                    context_id = %context,
                    item_id = %item,
                    steps = steps.len(),
                    "attempt succeeded"
                );
                AttemptResult::Succeeded { steps }
            }
            Err(halt) => {
                match &halt {
                    AttemptResult::Failed { step, detail } => {
                        crate::metrics::attempt_failed(step.name());
                        warn!(
                            target = "reupload.pipeline",
                            context_id = %context,
                            item_id = %item,
                            step = step.name(),
                            detail = %detail,
                            "step failed"
                        );
                    }
                    AttemptResult::Interrupted { after } => {
                        warn!(
                            target = "reupload.pipeline",
                            context_id = %context,
                            item_id = %item,
                            after = after.map(Step::name).unwrap_or("start"),
                            "challenge detected"
                        );
                    }
                    AttemptResult::SessionLost { step, detail } => {
                        warn!(
                            target = "reupload.pipeline",
                            context_id = %context,
                            item_id = %item,
                            step = step.map(Step::name).unwrap_or("interrupt_check"),
                            detail = %detail,
                            "session lost"
                        );
                    }
                    AttemptResult::Succeeded { .. } => {}
                }
                halt
            }
        }
    }

    fn execute(
        &self,
        driver: &mut dyn CapabilityDriver,
        context: &ContextId,
        item: &ItemId,
        steps: &mut Vec<StepReport>,
    ) -> Result<(), AttemptResult> {
        check_interrupt(driver, None)?;

        capture_step(driver, Step::Navigate, steps, "navigation failed", |d| {
            d.navigate_to_item(context, item).map(Some)
        })?;

        let timeout = self.preview_timeout;
        capture_step(driver, Step::WaitForPreviews, steps, "no preview images", |d| {
            d.wait_for_preview_images(timeout).map(|found| found.then_some(()))
        })?;

        capture_step(driver, Step::OpenGallery, steps, "gallery did not open", |d| {
            d.open_image_gallery().map(|opened| opened.then_some(()))
        })?;

        let source = capture_step(
            driver,
            Step::ExtractLatestSource,
            steps,
            "no loaded image in gallery",
            |d| d.latest_image_source(),
        )?;

        let local = capture_step(driver, Step::Download, steps, "download failed", |d| {
            d.download_image(&source).map(Some)
        })?;

        capture_step(
            driver,
            Step::SubmitReplacement,
            steps,
            "upload input not available",
            |d| d.submit_replacement_file(&local).map(|done| done.then_some(())),
        )?;

        capture_step(driver, Step::ConfirmAndSave, steps, "save control not found", |d| {
            d.confirm_and_save().map(|saved| saved.then_some(()))
        })?;

        Ok(())
    }
}

/// Runs one step, records its timing, and checks for a challenge after the
/// steps that can provoke one. `Ok(None)` from the step means it failed with
/// `missing` as the detail. A failed step is reported as an interrupt when a
/// challenge is showing, since the challenge is what made it fail.
fn capture_step<T>(
    driver: &mut dyn CapabilityDriver,
    step: Step,
    steps: &mut Vec<StepReport>,
    missing: &str,
    run: impl FnOnce(&mut dyn CapabilityDriver) -> Result<Option<T>, DriverError>,
) -> Result<T, AttemptResult> {
    let started = Instant::now();
    let value = match run(&mut *driver) {
        Ok(Some(value)) => value,
        Ok(None) => {
            check_interrupt(driver, Some(step))?;
            return Err(AttemptResult::Failed {
                step,
                detail: missing.to_string(),
            });
        }
        Err(DriverError::Step(detail)) => {
            check_interrupt(driver, Some(step))?;
            return Err(AttemptResult::Failed { step, detail });
        }
        Err(DriverError::SessionLost(detail)) => {
            return Err(AttemptResult::SessionLost {
                step: Some(step),
                detail,
            });
        }
    };
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::step_elapsed(step.name(), elapsed_ms);
    steps.push(StepReport::new(step, elapsed_ms));

    if step.is_risky() {
        check_interrupt(driver, Some(step))?;
    }
    Ok(value)
}

fn check_interrupt(
    driver: &mut dyn CapabilityDriver,
    after: Option<Step>,
) -> Result<(), AttemptResult> {
    match driver.detect_interrupt() {
        Ok(false) => Ok(()),
        Ok(true) => Err(AttemptResult::Interrupted { after }),
        Err(DriverError::SessionLost(detail)) => {
            Err(AttemptResult::SessionLost { step: after, detail })
        }
        Err(DriverError::Step(detail)) => {
            debug!(target = "reupload.pipeline", detail = %detail, "interrupt check inconclusive");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AttemptScript, DriverCall, ScriptedDriver};
    use pretty_assertions::assert_eq;

    fn pipeline() -> ItemPipeline {
        ItemPipeline::new(Duration::from_millis(10))
    }

    fn ctx() -> ContextId {
        ContextId::new("77")
    }

    #[test]
    fn successful_attempt_runs_every_step_in_order() {
        let mut driver = ScriptedDriver::new();
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        let AttemptResult::Succeeded { steps } = result else {
            panic!("expected a successful attempt");
        };
        let order: Vec<Step> = steps.iter().map(|report| report.step).collect();
        assert_eq!(order, Step::ALL.to_vec());
        assert_eq!(log.steps_for(&item), Step::ALL.to_vec());
    }

    #[test]
    fn timings_render_in_step_order() {
        let steps = vec![
            StepReport::new(Step::Navigate, 12),
            StepReport::new(Step::Download, 340),
        ];
        assert_eq!(describe_timings(&steps), "navigate 12ms, download 340ms");
    }

    #[test]
    fn interrupt_checks_surround_risky_steps() {
        let mut driver = ScriptedDriver::new();
        let log = driver.call_log();
        let item = ItemId::new("A1");
        pipeline().run_attempt(&mut driver, &ctx(), &item);

        let calls = log.snapshot();
        assert_eq!(calls.first(), Some(&DriverCall::DetectInterrupt));
        let checks = calls
            .iter()
            .filter(|call| **call == DriverCall::DetectInterrupt)
            .count();
        assert_eq!(checks, 1 + Step::ALL.iter().filter(|s| s.is_risky()).count());

        let after_gallery = calls
            .iter()
            .position(|call| *call == DriverCall::Step(Step::OpenGallery, item.clone()))
            .unwrap();
        assert_eq!(calls[after_gallery + 1], DriverCall::DetectInterrupt);
    }

    #[test]
    fn first_failing_step_ends_the_attempt() {
        let mut driver = ScriptedDriver::new()
            .script("A1", [AttemptScript::FailAt(Step::WaitForPreviews)]);
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        assert_eq!(
            result,
            AttemptResult::Failed {
                step: Step::WaitForPreviews,
                detail: "no preview images".into(),
            }
        );
        assert_eq!(log.steps_for(&item), vec![Step::Navigate, Step::WaitForPreviews]);
    }

    #[test]
    fn navigation_error_is_a_step_failure() {
        let mut driver = ScriptedDriver::new().script("A1", [AttemptScript::FailAt(Step::Navigate)]);
        let result = pipeline().run_attempt(&mut driver, &ctx(), &ItemId::new("A1"));
        assert!(matches!(
            result,
            AttemptResult::Failed {
                step: Step::Navigate,
                ..
            }
        ));
    }

    #[test]
    fn missing_source_fails_extraction() {
        let mut driver = ScriptedDriver::new()
            .script("A1", [AttemptScript::FailAt(Step::ExtractLatestSource)]);
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        assert_eq!(
            result,
            AttemptResult::Failed {
                step: Step::ExtractLatestSource,
                detail: "no loaded image in gallery".into(),
            }
        );
        assert_eq!(
            log.steps_for(&item),
            vec![
                Step::Navigate,
                Step::WaitForPreviews,
                Step::OpenGallery,
                Step::ExtractLatestSource,
            ]
        );
    }

    #[test]
    fn step_failing_under_a_challenge_interrupts() {
        let mut driver = ScriptedDriver::new()
            .script("A1", [AttemptScript::FailWithChallengeAt(Step::OpenGallery)]);
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        assert_eq!(
            result,
            AttemptResult::Interrupted {
                after: Some(Step::OpenGallery)
            }
        );
        assert_eq!(
            log.steps_for(&item),
            vec![Step::Navigate, Step::WaitForPreviews, Step::OpenGallery]
        );
    }

    #[test]
    fn challenge_after_risky_step_interrupts() {
        let mut driver = ScriptedDriver::new()
            .script("A1", [AttemptScript::InterruptAfter(Step::OpenGallery)]);
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        assert_eq!(
            result,
            AttemptResult::Interrupted {
                after: Some(Step::OpenGallery)
            }
        );
        assert_eq!(
            log.steps_for(&item),
            vec![Step::Navigate, Step::WaitForPreviews, Step::OpenGallery]
        );
    }

    #[test]
    fn challenge_before_start_runs_no_steps() {
        let mut driver = ScriptedDriver::new().challenge_on_start();
        let log = driver.call_log();
        let item = ItemId::new("A1");

        let result = pipeline().run_attempt(&mut driver, &ctx(), &item);

        assert_eq!(result, AttemptResult::Interrupted { after: None });
        assert!(log.steps_for(&item).is_empty());
    }

    #[test]
    fn lost_session_is_reported_with_its_step() {
        let mut driver = ScriptedDriver::new()
            .script("A1", [AttemptScript::LoseSessionAt(Step::Download)]);
        let result = pipeline().run_attempt(&mut driver, &ctx(), &ItemId::new("A1"));
        assert!(matches!(
            result,
            AttemptResult::SessionLost {
                step: Some(Step::Download),
                ..
            }
        ));
    }
}
