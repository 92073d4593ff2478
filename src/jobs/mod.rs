use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod event;
pub mod queue;

pub use event::{JobEvent, JobFailure};
pub use queue::QueueClient;

/// Contract a job type implements to be observable and retryable with full
/// fidelity. Jobs that skip it are still recorded from their envelope alone;
/// they just lose declared tags, payload field capture, and retry
/// restoration.
pub trait QueueableJob: Send + Sync {
    /// Fully-qualified job type name as the queue reports it.
    fn name(&self) -> &str;

    /// Tags the job wants attached to its runs.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Retry-chain marker: id of the run this instance was retried from.
    fn retry_of(&self) -> Option<i64>;

    fn set_retry_of(&mut self, run_id: i64);

    /// The job's declared fields as JSON-safe values. This is what gets
    /// captured into the stored payload and what restoration reads back.
    fn command_data(&self) -> Value;
}

type RestoreFn = fn(&Value) -> Option<Box<dyn QueueableJob>>;
type ConstructFn = fn() -> Box<dyn QueueableJob>;

struct JobEntry {
    restore: RestoreFn,
    construct: ConstructFn,
}

/// Name-keyed registry of known job types. Restoration is restricted to the
/// single entry registered under the expected name; there is deliberately no
/// broader allow-list.
#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<String, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J>(&mut self, name: &str)
    where
        J: QueueableJob + DeserializeOwned + Default + 'static,
    {
        self.entries.insert(
            name.to_string(),
            JobEntry {
                restore: |command| {
                    serde_json::from_value::<J>(command.clone())
                        .ok()
                        .map(|job| Box::new(job) as Box<dyn QueueableJob>)
                },
                construct: || Box::new(J::default()) as Box<dyn QueueableJob>,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Deserialize `command` as exactly the type registered under
    /// `expected`. Unknown name, malformed data, or a restored instance
    /// reporting a different name all return None.
    pub fn restore(&self, expected: &str, command: &Value) -> Option<Box<dyn QueueableJob>> {
        let entry = self.entries.get(expected)?;
        let job = (entry.restore)(command)?;
        if job.name() != expected {
            return None;
        }
        Some(job)
    }

    /// Best-effort bare instance for retry when no payload was ever stored.
    pub fn construct_default(&self, expected: &str) -> Option<Box<dyn QueueableJob>> {
        let entry = self.entries.get(expected)?;
        let job = (entry.construct)();
        if job.name() != expected {
            return None;
        }
        Some(job)
    }
}
