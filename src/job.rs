//! The wire-format job record.
//!
//! Jobs are serialized as JSON objects compatible with the established
//! Sidekiq payload, so peer producers and consumers in other runtimes can
//! share the same Redis. Decoding tolerates unknown fields; encoding writes
//! only the recognized set.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of work as stored in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique 128-bit hex identifier.
    pub jid: String,

    /// Worker class name, optionally carrying a `/method` selector.
    pub class: String,

    /// Positional arguments handed to the worker.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Queue the job was enqueued on.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Floating seconds since epoch at enqueue time.
    #[serde(default)]
    pub enqueued_at: f64,

    /// Retry budget: a boolean (use the configured default) or an explicit
    /// integer count.
    #[serde(default)]
    pub retry: Retry,

    /// Number of failed attempts so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Epoch seconds of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    /// Host that last dequeued this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
}

fn default_queue() -> String {
    "default".to_string()
}

impl Job {
    /// Builds a fresh job with a generated jid, stamped `enqueued_at = now`.
    pub fn build(queue: impl Into<String>, class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            jid: new_jid(),
            class: class.into(),
            args,
            queue: queue.into(),
            enqueued_at: now_epoch(),
            retry: Retry::default(),
            retry_count: None,
            failed_at: None,
            error_message: None,
            error_class: None,
            processor: None,
        }
    }

    /// Serializes to the wire payload.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a wire payload.
    ///
    /// Unknown fields are ignored. Fails with [`Error::MalformedJob`] when
    /// the payload is not a JSON object or `jid`/`class` are missing or
    /// empty.
    pub fn decode(raw: &str) -> Result<Self> {
        let job: Job =
            serde_json::from_str(raw).map_err(|err| Error::MalformedJob(err.to_string()))?;
        if job.jid.is_empty() {
            return Err(Error::MalformedJob("jid is empty".to_string()));
        }
        if job.class.is_empty() {
            return Err(Error::MalformedJob("class is empty".to_string()));
        }
        Ok(job)
    }

    /// Stamps the failure metadata for one failed attempt and bumps
    /// `retry_count`.
    pub fn record_failure(&mut self, error_class: &str, error_message: &str) {
        self.retry_count = Some(self.retry_count.unwrap_or(0) + 1);
        self.failed_at = Some(now_epoch());
        self.error_class = Some(error_class.to_string());
        self.error_message = Some(error_message.to_string());
    }
}

/// The `retry` wire field. Peer producers send either a boolean flag or an
/// explicit attempt budget; both are accepted and normalized via
/// [`Retry::budget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Retry {
    Flag(bool),
    Limit(u32),
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Flag(true)
    }
}

impl Retry {
    /// The effective attempt budget given the configured default.
    pub fn budget(self, default_max: u32) -> u32 {
        match self {
            Retry::Flag(true) => default_max,
            Retry::Flag(false) => 0,
            Retry::Limit(n) => n,
        }
    }
}

/// Generates a 128-bit hex job identifier.
pub fn new_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current wall clock as floating seconds since epoch.
pub fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_jids_are_128_bit_hex() {
        let jid = new_jid();
        assert_eq!(jid.len(), 32);
        assert!(jid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(jid, new_jid());
    }

    #[test]
    fn encode_decode_round_trip() {
        let job = Job::build("default", "HardWorker", vec![json!(1), json!("x")]);
        let raw = job.encode().unwrap();
        let back = Job::decode(&raw).unwrap();

        assert_eq!(back.jid, job.jid);
        assert_eq!(back.class, "HardWorker");
        assert_eq!(back.args, vec![json!(1), json!("x")]);
        assert_eq!(back.queue, "default");
        assert_eq!(back.retry, Retry::Flag(true));
        assert!(back.enqueued_at > 0.0);
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let raw = r#"{"jid":"abc123","class":"Mailer","args":[],"queue":"mail",
                      "enqueued_at":1.0,"created_at":1.0,"backtrace":true,"tags":["x"]}"#;
        let job = Job::decode(raw).unwrap();
        assert_eq!(job.jid, "abc123");
        assert_eq!(job.queue, "mail");
    }

    #[test]
    fn decode_rejects_missing_jid() {
        let raw = r#"{"class":"Mailer","args":[],"queue":"mail"}"#;
        assert!(matches!(Job::decode(raw), Err(Error::MalformedJob(_))));

        let raw = r#"{"jid":"","class":"Mailer"}"#;
        assert!(matches!(Job::decode(raw), Err(Error::MalformedJob(_))));
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(Job::decode("not json"), Err(Error::MalformedJob(_))));
    }

    #[test]
    fn retry_accepts_bool_and_integer() {
        let job = Job::decode(r#"{"jid":"a","class":"W","retry":false}"#).unwrap();
        assert_eq!(job.retry.budget(25), 0);

        let job = Job::decode(r#"{"jid":"a","class":"W","retry":true}"#).unwrap();
        assert_eq!(job.retry.budget(25), 25);

        let job = Job::decode(r#"{"jid":"a","class":"W","retry":5}"#).unwrap();
        assert_eq!(job.retry.budget(25), 5);
    }

    #[test]
    fn record_failure_stamps_metadata() {
        let mut job = Job::build("default", "Flaky", vec![]);
        job.record_failure("WorkerRaised", "boom");

        assert_eq!(job.retry_count, Some(1));
        assert_eq!(job.error_class.as_deref(), Some("WorkerRaised"));
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.failed_at.is_some());

        job.record_failure("WorkerRaised", "boom again");
        assert_eq!(job.retry_count, Some(2));
    }

    #[test]
    fn optional_fields_stay_off_the_wire() {
        let job = Job::build("default", "Clean", vec![]);
        let raw = job.encode().unwrap();
        assert!(!raw.contains("error_class"));
        assert!(!raw.contains("failed_at"));
        assert!(!raw.contains("processor"));
    }
}
