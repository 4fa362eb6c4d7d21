//! Scripted capability driver.
//!
//! Each `navigate_to_item` consumes the next [`AttemptScript`] queued for
//! that item (items without a script succeed). Every call is appended to a
//! shared log that stays readable after the driver moves to the worker thread.

use super::{CapabilityDriver, DriverError, Step};
use crate::models::{ContextId, ItemId};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptScript {
    #[default]
    Succeed,
    /// The given step reports failure.
    FailAt(Step),
    /// A challenge appears right after the given step completes; the next
    /// interrupt check observes it once.
    InterruptAfter(Step),
    /// The given step fails because a challenge appeared during it.
    FailWithChallengeAt(Step),
    /// The session dies while running the given step.
    LoseSessionAt(Step),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    DetectInterrupt,
    Step(Step, ItemId),
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<DriverCall>>>);

impl CallLog {
    fn push(&self, call: DriverCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub fn snapshot(&self) -> Vec<DriverCall> {
        self.0.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Steps executed for `item`, in order.
    pub fn steps_for(&self, item: &ItemId) -> Vec<Step> {
        self.snapshot()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::Step(step, id) if &id == item => Some(step),
                _ => None,
            })
            .collect()
    }

    /// Number of pipeline runs (navigations) for `item`.
    pub fn navigations(&self, item: &ItemId) -> usize {
        self.steps_for(item)
            .into_iter()
            .filter(|step| *step == Step::Navigate)
            .count()
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    scripts: HashMap<ItemId, VecDeque<AttemptScript>>,
    current_item: Option<ItemId>,
    current_script: AttemptScript,
    challenge_pending: bool,
    calls: CallLog,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues scripts for consecutive attempts on `item`.
    pub fn script(mut self, item: &str, attempts: impl IntoIterator<Item = AttemptScript>) -> Self {
        self.scripts
            .entry(ItemId::new(item))
            .or_default()
            .extend(attempts);
        self
    }

    /// A challenge is already showing before the first step runs.
    pub fn challenge_on_start(mut self) -> Self {
        self.challenge_pending = true;
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    fn run_step(&mut self, step: Step) -> Result<bool, DriverError> {
        let item = self
            .current_item
            .clone()
            .ok_or_else(|| DriverError::step("no item is open"))?;
        self.calls.push(DriverCall::Step(step, item));
        match self.current_script {
            AttemptScript::FailAt(failing) if failing == step => Ok(false),
            AttemptScript::FailWithChallengeAt(failing) if failing == step => {
                self.challenge_pending = true;
                Ok(false)
            }
            AttemptScript::LoseSessionAt(lost) if lost == step => Err(DriverError::SessionLost(
                format!("browser exited during {step}"),
            )),
            AttemptScript::InterruptAfter(at) if at == step => {
                self.challenge_pending = true;
                Ok(true)
            }
            _ => Ok(true),
        }
    }
}

impl CapabilityDriver for ScriptedDriver {
    fn detect_interrupt(&mut self) -> Result<bool, DriverError> {
        self.calls.push(DriverCall::DetectInterrupt);
        Ok(std::mem::take(&mut self.challenge_pending))
    }

    fn navigate_to_item(&mut self, _context: &ContextId, item: &ItemId) -> Result<(), DriverError> {
        self.current_item = Some(item.clone());
        self.current_script = self
            .scripts
            .get_mut(item)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        if self.run_step(Step::Navigate)? {
            Ok(())
        } else {
            Err(DriverError::step("navigation failed"))
        }
    }

    fn wait_for_preview_images(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        self.run_step(Step::WaitForPreviews)
    }

    fn open_image_gallery(&mut self) -> Result<bool, DriverError> {
        self.run_step(Step::OpenGallery)
    }

    fn latest_image_source(&mut self) -> Result<Option<String>, DriverError> {
        let found = self.run_step(Step::ExtractLatestSource)?;
        Ok(found.then(|| {
            let item = self.current_item.as_ref().map(ItemId::as_str).unwrap_or("");
            format!("//avatars.scripted.test/{item}/last.webp")
        }))
    }

    fn download_image(&mut self, _url: &str) -> Result<PathBuf, DriverError> {
        if self.run_step(Step::Download)? {
            let item = self.current_item.as_ref().map(ItemId::as_str).unwrap_or("");
            Ok(PathBuf::from(format!("scripted/{item}/orig.webp")))
        } else {
            Err(DriverError::step("download refused"))
        }
    }

    fn submit_replacement_file(&mut self, _path: &Path) -> Result<bool, DriverError> {
        self.run_step(Step::SubmitReplacement)
    }

    fn confirm_and_save(&mut self) -> Result<bool, DriverError> {
        self.run_step(Step::ConfirmAndSave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_consumed_per_navigation() {
        let mut driver = ScriptedDriver::new().script(
            "A1",
            [AttemptScript::FailAt(Step::OpenGallery), AttemptScript::Succeed],
        );
        let log = driver.call_log();
        let ctx = ContextId::new("77");
        let item = ItemId::new("A1");

        driver.navigate_to_item(&ctx, &item).unwrap();
        assert!(!driver.open_image_gallery().unwrap());

        driver.navigate_to_item(&ctx, &item).unwrap();
        assert!(driver.open_image_gallery().unwrap());
        assert_eq!(log.navigations(&item), 2);
    }

    #[test]
    fn challenge_is_observed_once() {
        let mut driver = ScriptedDriver::new().script("A1", [AttemptScript::InterruptAfter(Step::Navigate)]);
        driver
            .navigate_to_item(&ContextId::new("77"), &ItemId::new("A1"))
            .unwrap();
        assert!(driver.detect_interrupt().unwrap());
        assert!(!driver.detect_interrupt().unwrap());
    }
}
