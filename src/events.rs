//! Worker → operator notifications.
//!
//! The worker only ever sends; a closed receiver is ignored so a vanished
//! operator surface never stalls a job.

use crate::models::ItemId;
use serde::Serialize;
use serde_with::skip_serializing_none;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;
use uuid::Uuid;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub succeeded: Vec<ItemId>,
    pub skipped: Vec<ItemId>,
    pub failed: Vec<ItemId>,
    pub aborted: bool,
    pub fatal: Option<String>,
}

impl JobSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            aborted: false,
            fatal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { job_id: Uuid },
    Log { job_id: Uuid, text: String },
    Progress { job_id: Uuid, done: usize, total: usize },
    Paused { job_id: Uuid, message: String },
    Resumed { job_id: Uuid },
    Finished { job_id: Uuid, summary: JobSummary },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Started { job_id }
            | JobEvent::Log { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Paused { job_id, .. }
            | JobEvent::Resumed { job_id }
            | JobEvent::Finished { job_id, .. } => *job_id,
        }
    }
}

/// Per-job handle the orchestrator reports through.
#[derive(Clone)]
pub struct EventSink {
    job_id: Uuid,
    tx: UnboundedSender<JobEvent>,
}

impl EventSink {
    pub fn new(job_id: Uuid, tx: UnboundedSender<JobEvent>) -> Self {
        Self { job_id, tx }
    }

    fn send(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn started(&self) {
        self.send(JobEvent::Started {
            job_id: self.job_id,
        });
    }

    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target = "reupload.worker", job_id = %self.job_id, "{text}");
        self.send(JobEvent::Log {
            job_id: self.job_id,
            text,
        });
    }

    pub fn progress(&self, done: usize, total: usize) {
        self.send(JobEvent::Progress {
            job_id: self.job_id,
            done,
            total,
        });
    }

    pub fn paused(&self, message: impl Into<String>) {
        self.send(JobEvent::Paused {
            job_id: self.job_id,
            message: message.into(),
        });
    }

    pub fn resumed(&self) {
        self.send(JobEvent::Resumed {
            job_id: self.job_id,
        });
    }

    pub fn finished(&self, summary: JobSummary) {
        self.send(JobEvent::Finished {
            job_id: self.job_id,
            summary,
        });
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn sink_tags_events_with_job_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job_id = Uuid::new_v4();
        let sink = EventSink::new(job_id, tx);
        sink.log("hello");
        sink.progress(1, 2);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.job_id() == job_id));
        assert_eq!(
            events[1],
            JobEvent::Progress {
                job_id,
                done: 1,
                total: 2
            }
        );
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(Uuid::new_v4(), tx);
        sink.log("nobody listens");
        sink.finished(JobSummary::new(0));
    }
}
