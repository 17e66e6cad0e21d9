//! ## Job Repository
//!
//! Owns the bounded, time-ordered window of live jobs for one chain, decides
//! which incoming jobs supersede which, schedules the periodic notify, and
//! reaps expired jobs.
//!
//! The repository is owned by the dispatch loop; every method here runs on
//! the dispatch thread, so the window needs no lock. The consumer half lives
//! in [`super::consumer`] and only talks to this struct through dispatched
//! tasks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use super::{Job, JobRecord};

pub struct JobRepository {
    chain_id: usize,
    jobs: BTreeMap<u64, Arc<JobRecord>>,
    max_jobs_life_time: u64,
    mining_notify_interval: u64,
    best_height: u64,
    last_job_send_time: u64,
    last_job_id: u64,
    last_job_height: u64,
    file_last_notify_time: Option<PathBuf>,
}

impl JobRepository {
    pub fn new(
        chain_id: usize,
        max_jobs_life_time: u64,
        mining_notify_interval: u64,
        file_last_notify_time: Option<PathBuf>,
    ) -> Self {
        assert!(
            mining_notify_interval < max_jobs_life_time,
            "mining notify interval must stay below the job lifetime"
        );
        Self {
            chain_id,
            jobs: BTreeMap::new(),
            max_jobs_life_time,
            mining_notify_interval,
            best_height: 0,
            last_job_send_time: 0,
            last_job_id: 0,
            last_job_height: 0,
            file_last_notify_time,
        }
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    pub fn max_jobs_life_time(&self) -> u64 {
        self.max_jobs_life_time
    }

    pub fn last_job_send_time(&self) -> u64 {
        self.last_job_send_time
    }

    pub fn last_job_height(&self) -> u64 {
        self.last_job_height
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: u64) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn get_by_id(&self, job_id: u64) -> Option<Arc<JobRecord>> {
        self.jobs.get(&job_id).cloned()
    }

    /// The record with the largest job id, i.e. the freshest one.
    pub fn get_latest(&self) -> Option<Arc<JobRecord>> {
        self.jobs.values().next_back().cloned()
    }

    pub fn mark_all_stale(&self) {
        for record in self.jobs.values() {
            record.mark_stale();
        }
    }

    pub fn create_job_record(&self, job: Arc<dyn Job>, is_clean: bool) -> Arc<JobRecord> {
        Arc::new(JobRecord::new(self.chain_id, job, is_clean))
    }

    /// Takes a freshly decoded job into the window.
    ///
    /// Default policy: a height above everything notified so far is a new
    /// tip, which stales every prior record and is worth an immediate
    /// notify (`record.is_clean()`); a same-height refresh waits for the
    /// periodic timer. Returns `None` for a duplicate id.
    pub fn broadcast(&mut self, job: Arc<dyn Job>) -> Option<Arc<JobRecord>> {
        let job_id = job.job_id();
        if self.contains(job_id) {
            error!("jobId {} already existed, chain {}", job_id, self.chain_id);
            return None;
        }

        let is_clean = job.height() > self.best_height;
        if is_clean {
            self.best_height = job.height();
            self.mark_all_stale();
        }
        let record = self.create_job_record(job, is_clean);
        self.jobs.insert(job_id, record.clone());
        Some(record)
    }

    /// Periodic-notify check: when nothing was sent for a full interval,
    /// the latest record is due for a refresh broadcast.
    pub fn check_and_send_notify(&mut self, now: u64) -> Option<Arc<JobRecord>> {
        if !self.jobs.is_empty() && self.last_job_send_time + self.mining_notify_interval <= now {
            self.get_latest()
        } else {
            None
        }
    }

    /// Bookkeeping after the server fanned `record` out to its sessions.
    ///
    /// The watchdog timestamp file is rewritten only when the notified job
    /// actually changed, so a stuck job maker shows up as a stale file.
    pub fn mark_notified(&mut self, record: &Arc<JobRecord>, now: u64) {
        self.last_job_send_time = now;

        let job_id = record.job().job_id();
        if self.last_job_id != job_id {
            if let Some(path) = &self.file_last_notify_time {
                if let Err(e) = write_notify_time(path, now as u32) {
                    error!(
                        "cannot write last notify time to {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        self.last_job_id = job_id;
        self.last_job_height = record.job().height();
    }

    /// Evicts records past their lifetime, oldest first. At least one record
    /// stays forever so miners keep working when the job maker stalls.
    pub fn try_clean_expired(&mut self, now: u64) {
        while self.jobs.len() > 1 {
            let Some((&job_id, _)) = self.jobs.iter().next() else {
                break;
            };
            let job_time = job_id >> 32;
            if now < job_time + self.max_jobs_life_time {
                break; // not expired
            }
            info!(
                "remove expired stratum job, id: {}, time: {}",
                job_id, job_time
            );
            self.jobs.remove(&job_id);
        }
    }
}

fn write_notify_time(path: &Path, timestamp: u32) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, timestamp.to_string())?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::test_support::job_at;

    fn repo() -> JobRepository {
        JobRepository::new(0, 300, 30, None)
    }

    #[test]
    #[should_panic]
    fn test_notify_interval_must_stay_below_lifetime() {
        JobRepository::new(0, 30, 30, None);
    }

    #[test]
    fn test_window_orders_by_job_id() {
        let mut repo = repo();
        repo.broadcast(job_at(1000, 2, 10)).unwrap();
        repo.broadcast(job_at(1010, 3, 10)).unwrap();
        repo.broadcast(job_at(990, 1, 9)).unwrap();

        let latest = repo.get_latest().unwrap();
        assert_eq!(latest.job().job_id() >> 32, 1010);
        assert_eq!(repo.len(), 3);
    }

    #[test]
    fn test_duplicate_job_id_is_a_noop() {
        let mut repo = repo();
        assert!(repo.broadcast(job_at(1000, 1, 10)).is_some());
        assert!(repo.broadcast(job_at(1000, 1, 10)).is_none());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_new_height_stales_predecessors() {
        let mut repo = repo();
        let first = repo.broadcast(job_at(1000, 1, 10)).unwrap();
        assert!(first.is_clean());

        let refresh = repo.broadcast(job_at(1010, 2, 10)).unwrap();
        assert!(!refresh.is_clean());
        assert!(!first.is_stale());

        let tip = repo.broadcast(job_at(1020, 3, 11)).unwrap();
        assert!(tip.is_clean());
        assert!(first.is_stale());
        assert!(refresh.is_stale());
        assert!(!tip.is_stale());
    }

    #[test]
    fn test_refresh_at_known_height_is_not_clean() {
        let mut repo = repo();
        let first = repo.broadcast(job_at(1000, 1, 10)).unwrap();
        assert!(first.is_clean());

        // same height again, even unnotified: a refresh, not a new tip
        let refresh = repo.broadcast(job_at(1005, 2, 10)).unwrap();
        assert!(!refresh.is_clean());
    }

    #[test]
    fn test_periodic_notify_schedule() {
        let mut repo = repo();
        let record = repo.broadcast(job_at(1000, 1, 10)).unwrap();
        repo.mark_notified(&record, 1000);

        assert!(repo.check_and_send_notify(1010).is_none());
        let due = repo.check_and_send_notify(1030).unwrap();
        assert_eq!(due.job().job_id(), record.job().job_id());

        repo.mark_notified(&due, 1030);
        assert!(repo.check_and_send_notify(1045).is_none());
        assert!(repo.check_and_send_notify(1060).is_some());
    }

    #[test]
    fn test_empty_window_never_notifies() {
        let mut repo = repo();
        assert!(repo.check_and_send_notify(u64::MAX / 2).is_none());
    }

    #[test]
    fn test_notify_file_changes_only_with_job_id() {
        let path = std::env::temp_dir().join(format!(
            "sserver_notify_test_{}_{}",
            std::process::id(),
            utils_unique()
        ));
        let mut repo = JobRepository::new(0, 300, 30, Some(path.clone()));

        let first = repo.broadcast(job_at(1000, 1, 10)).unwrap();
        repo.mark_notified(&first, 1000);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1000");

        // same job re-notified by the timer: the file keeps its timestamp
        repo.mark_notified(&first, 1030);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1000");

        let second = repo.broadcast(job_at(1040, 2, 11)).unwrap();
        repo.mark_notified(&second, 1040);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1040");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_expiry_keeps_at_least_one_job() {
        let mut repo = repo();
        repo.broadcast(job_at(0, 1, 10)).unwrap();
        repo.broadcast(job_at(10, 2, 10)).unwrap();
        repo.broadcast(job_at(20, 3, 10)).unwrap();

        repo.try_clean_expired(299);
        assert_eq!(repo.len(), 3);

        repo.try_clean_expired(301);
        assert_eq!(repo.len(), 2);

        repo.try_clean_expired(321);
        assert_eq!(repo.len(), 1);

        // the survivor outlives its lifetime indefinitely
        repo.try_clean_expired(1000);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get_latest().unwrap().job().job_time(), 20);
    }

    #[test]
    fn test_get_by_id() {
        let mut repo = repo();
        let record = repo.broadcast(job_at(1000, 7, 10)).unwrap();
        let job_id = record.job().job_id();
        assert!(repo.get_by_id(job_id).is_some());
        assert!(repo.get_by_id(job_id + 1).is_none());
    }

    fn utils_unique() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }
}
