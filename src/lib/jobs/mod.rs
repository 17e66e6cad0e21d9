//! Mining-job model.
//!
//! The core treats jobs as opaque values behind the [`Job`] trait: a 64-bit
//! id whose high 32 bits are the creation timestamp, a job time, a height,
//! and a payload that sessions forward to miners verbatim. Per-coin wire
//! formats live in [`JobDecoder`] implementations; [`JsonJob`] is the
//! default JSON rendering.

pub mod consumer;
pub mod repository;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{SserverError, SserverResult};

pub trait Job: Send + Sync + fmt::Debug {
    /// Monotonically-assigned id; `job_id >> 32` is the creation timestamp.
    fn job_id(&self) -> u64;
    fn job_time(&self) -> u64;
    fn height(&self) -> u64;
    /// The body broadcast to miners inside `mining.notify`.
    fn payload(&self) -> &Value;
}

/// Per-coin seam: turns a raw job-bus payload into a [`Job`].
pub trait JobDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> SserverResult<Arc<dyn Job>>;
}

/// Default job flavor: a JSON object carrying at least `jobId`, usually
/// `jobTime` and `height`, plus whatever the coin family needs.
#[derive(Debug)]
pub struct JsonJob {
    job_id: u64,
    job_time: u64,
    height: u64,
    body: Value,
}

impl JsonJob {
    pub fn from_slice(raw: &[u8]) -> SserverResult<Self> {
        let body: Value = serde_json::from_slice(raw)?;
        let job_id = body
            .get("jobId")
            .and_then(Value::as_u64)
            .ok_or_else(|| SserverError::JobDecode("missing or non-integer `jobId`".into()))?;
        let job_time = body
            .get("jobTime")
            .and_then(Value::as_u64)
            .unwrap_or(job_id >> 32);
        let height = body.get("height").and_then(Value::as_u64).unwrap_or(0);
        Ok(Self {
            job_id,
            job_time,
            height,
            body,
        })
    }
}

impl Job for JsonJob {
    fn job_id(&self) -> u64 {
        self.job_id
    }

    fn job_time(&self) -> u64 {
        self.job_time
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn payload(&self) -> &Value {
        &self.body
    }
}

#[derive(Debug, Default)]
pub struct JsonJobDecoder;

impl JobDecoder for JsonJobDecoder {
    fn decode(&self, raw: &[u8]) -> SserverResult<Arc<dyn Job>> {
        Ok(Arc::new(JsonJob::from_slice(raw)?))
    }
}

const STATE_MINING: u8 = 0;
const STATE_STALE: u8 = 1;

/// A job as held by the repository window and by in-flight broadcasts.
///
/// Shared by reference count; the staleness flag is the only mutable part
/// and moves MINING -> STALE exactly once.
#[derive(Debug)]
pub struct JobRecord {
    chain_id: usize,
    is_clean: bool,
    state: AtomicU8,
    job: Arc<dyn Job>,
}

impl JobRecord {
    pub fn new(chain_id: usize, job: Arc<dyn Job>, is_clean: bool) -> Self {
        Self {
            chain_id,
            is_clean,
            state: AtomicU8::new(STATE_MINING),
            job,
        }
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    pub fn is_clean(&self) -> bool {
        self.is_clean
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn mark_stale(&self) {
        self.state.store(STATE_STALE, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_STALE
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_json_job() {
        let raw = serde_json::to_vec(&json!({
            "jobId": (1700000000u64 << 32) | 5,
            "jobTime": 1700000000u64,
            "height": 840000,
            "prevHash": "00aa"
        }))
        .unwrap();
        let job = JsonJobDecoder.decode(&raw).unwrap();
        assert_eq!(job.job_id() >> 32, 1700000000);
        assert_eq!(job.height(), 840000);
        assert_eq!(job.payload()["prevHash"], "00aa");
    }

    #[test]
    fn test_job_time_falls_back_to_id_high_half() {
        let raw = serde_json::to_vec(&json!({"jobId": (42u64 << 32) | 1})).unwrap();
        let job = JsonJobDecoder.decode(&raw).unwrap();
        assert_eq!(job.job_time(), 42);
    }

    #[test]
    fn test_decode_rejects_missing_job_id() {
        assert!(JsonJobDecoder.decode(br#"{"height": 1}"#).is_err());
        assert!(JsonJobDecoder.decode(b"not json").is_err());
    }

    #[test]
    fn test_staleness_is_monotonic() {
        let record = JobRecord::new(0, test_support::job_at(100, 1, 1), true);
        assert!(!record.is_stale());
        record.mark_stale();
        assert!(record.is_stale());
        record.mark_stale();
        assert!(record.is_stale());
    }
}
