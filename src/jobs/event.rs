use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The execution envelope the external queue hands us with every lifecycle
/// event. The broker fills in what it knows; every field except `job_class`
/// is optional by design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// The queue's native uuid for this execution, when it exposes one.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Older runners expose only a job id; it works as a correlation key
    /// just as well.
    #[serde(default)]
    pub job_id: Option<String>,
    pub job_class: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: i32,
    /// The raw payload exactly as the queue carries it.
    #[serde(default)]
    pub payload: Value,
    /// Set when the queue "processed" the job only to immediately release it
    /// back (rate limiting and friends). Such runs are not recorded.
    #[serde(default)]
    pub released: bool,
}

fn default_attempt() -> i32 {
    1
}

impl JobEvent {
    /// Stable correlation key, if the queue supplied one.
    pub fn correlation_key(&self) -> Option<&str> {
        self.uuid
            .as_deref()
            .filter(|v| !v.is_empty())
            .or_else(|| self.job_id.as_deref().filter(|v| !v.is_empty()))
    }

    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or("default")
    }
}

/// Exception details accompanying a failure event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub exception_class: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_prefers_uuid_over_job_id() {
        let event = JobEvent {
            uuid: Some("u-1".into()),
            job_id: Some("42".into()),
            job_class: "EmailJob".into(),
            queue: None,
            connection: None,
            attempt: 1,
            payload: Value::Null,
            released: false,
        };
        assert_eq!(event.correlation_key(), Some("u-1"));
    }

    #[test]
    fn empty_identifiers_do_not_count_as_stable() {
        let event = JobEvent {
            uuid: Some(String::new()),
            job_id: None,
            job_class: "EmailJob".into(),
            queue: None,
            connection: None,
            attempt: 1,
            payload: Value::Null,
            released: false,
        };
        assert_eq!(event.correlation_key(), None);
        assert_eq!(event.queue_name(), "default");
    }
}
