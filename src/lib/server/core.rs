//! Dispatch queue and the single-writer server state.
//!
//! All mutations of the connection table and the per-chain job windows run
//! on the event-loop task, which owns [`ServerCore`] exclusively. Background
//! tasks (job consumers, the user updater, session readers) only reach that
//! state by posting closures through [`Dispatcher`]; posting never blocks
//! and the closures run in FIFO order. With that discipline in place, none
//! of these structures needs a lock.

use std::collections::HashMap;
use std::sync::Arc;

use nohash_hasher::BuildNoHashHasher;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DifficultyConfig;
use crate::jobs::repository::JobRepository;
use crate::jobs::{Job, JobRecord};
use crate::kafka::KafkaProducer;
use crate::metrics::ServerMetrics;
use crate::server::session::{worker_id_of, PendingAuth, SessionHandle};
use crate::session_id::SessionIdAllocator;
use crate::stratum::{self, Message};
use crate::users::{UserDirectory, WorkerName};
use crate::utils::now_unix;

pub const SESSION_ID_BITS: u32 = 24;

pub type DispatchTask = Box<dyn FnOnce(&mut ServerCore) + Send + 'static>;

/// Posts zero-delay tasks onto the event-loop thread, exactly once each, in
/// post order.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatchTask>,
}

impl Dispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut ServerCore) + Send + 'static,
    {
        // a closed queue means the server loop already exited
        let _ = self.tx.send(Box::new(task));
    }
}

/// Everything the server owns for one chain.
pub struct ChainState {
    pub name: String,
    pub repository: JobRepository,
    pub share_log: Arc<KafkaProducer>,
    pub solved_share: Arc<KafkaProducer>,
    pub common_events: Arc<KafkaProducer>,
}

/// Behavior flags resolved from the config at setup.
#[derive(Debug, Clone)]
pub struct ServerPolicy {
    pub accept_stale: bool,
    pub enable_simulator: bool,
    pub enable_submit_invalid_block: bool,
    pub enable_dev_mode: bool,
    pub dev_fixed_difficulty: f64,
}

pub struct ServerCore {
    connections: HashMap<u32, SessionHandle, BuildNoHashHasher<u32>>,
    chains: Vec<ChainState>,
    session_ids: Arc<SessionIdAllocator<SESSION_ID_BITS>>,
    user_directory: Arc<UserDirectory>,
    difficulty: DifficultyConfig,
    policy: ServerPolicy,
    metrics: Arc<ServerMetrics>,
}

impl ServerCore {
    pub fn new(
        chains: Vec<ChainState>,
        session_ids: Arc<SessionIdAllocator<SESSION_ID_BITS>>,
        user_directory: Arc<UserDirectory>,
        difficulty: DifficultyConfig,
        policy: ServerPolicy,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            connections: HashMap::with_hasher(BuildNoHashHasher::default()),
            chains,
            session_ids,
            user_directory,
            difficulty,
            policy,
            metrics,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn chain(&self, chain_id: usize) -> Option<&ChainState> {
        self.chains.get(chain_id)
    }

    pub fn user_directory(&self) -> &Arc<UserDirectory> {
        &self.user_directory
    }

    pub fn insert_connection(&mut self, handle: SessionHandle) {
        self.connections.insert(handle.session_id(), handle);
        self.metrics.sessions.set(self.connections.len() as i64);
        self.metrics.connections_total.inc();
    }

    /// Entry point for a job freshly decoded off the bus. Duplicates are
    /// dropped; a clean record goes out immediately, refreshes wait for the
    /// periodic notify.
    pub fn handle_incoming_job(&mut self, chain_id: usize, job: Arc<dyn Job>) {
        let Some(chain) = self.chains.get_mut(chain_id) else {
            return;
        };
        match chain.repository.broadcast(job) {
            None => {} // duplicate job id, already logged
            Some(record) if record.is_clean() => self.send_notify(chain_id, &record),
            Some(_) => {}
        }
    }

    /// Periodic per-chain upkeep driven by the consumer loop: refresh
    /// notifies and expired-job eviction.
    pub fn chain_maintenance(&mut self, chain_id: usize) {
        let now = now_unix();
        let due = self
            .chains
            .get_mut(chain_id)
            .and_then(|chain| chain.repository.check_and_send_notify(now));
        if let Some(record) = due {
            self.send_notify(chain_id, &record);
        }
        if let Some(chain) = self.chains.get_mut(chain_id) {
            chain.repository.try_clean_expired(now);
            self.metrics
                .last_notify_age
                .with_label_values(&[chain.name.as_str()])
                .set(now.saturating_sub(chain.repository.last_job_send_time()) as i64);
        }
    }

    /// Fans `record` out to this chain's sessions and records the notify.
    pub fn send_notify(&mut self, chain_id: usize, record: &Arc<JobRecord>) {
        let now = now_unix();
        self.send_notify_to_all(chain_id, record);
        if let Some(chain) = self.chains.get_mut(chain_id) {
            chain.repository.mark_notified(record, now);
            self.metrics
                .job_broadcasts
                .with_label_values(&[chain.name.as_str()])
                .inc();
        }
    }

    /// One pass over the connection table: dead sessions are erased and
    /// their ids recycled, live sessions on the matching chain get the job.
    pub fn send_notify_to_all(&mut self, chain_id: usize, record: &Arc<JobRecord>) {
        let session_ids = self.session_ids.clone();
        self.connections.retain(|_, conn| {
            if conn.is_dead() {
                debug!("session {:08x} reclaimed", conn.session_id());
                session_ids.free(conn.session_id());
                false
            } else {
                if conn.chain_id() == chain_id {
                    conn.send_notify(record);
                }
                true
            }
        });
        self.metrics.sessions.set(self.connections.len() as i64);
    }

    /// Moves every session of `user_name` onto `new_chain_id`; returns how
    /// many switched.
    pub fn switch_chain(&mut self, user_name: &str, new_chain_id: usize) -> usize {
        let Some(chain) = self.chains.get(new_chain_id) else {
            warn!("switch_chain to unknown chain {}", new_chain_id);
            return 0;
        };
        let latest = chain.repository.get_latest();
        let mut switched = 0;
        for conn in self.connections.values() {
            if conn.chain_id() != new_chain_id
                && conn.user_name().as_deref() == Some(user_name)
            {
                conn.switch_chain(new_chain_id, latest.as_ref());
                switched += 1;
            }
        }
        info!(
            "switched {} sessions of user {} to chain {}",
            switched, user_name, new_chain_id
        );
        switched
    }

    /// Offers a now-registered user name to every session; returns how many
    /// parked authorizations it completed.
    pub fn auto_reg_callback(&mut self, user_name: &str) -> usize {
        let user_id = self.user_directory.get_user_id(user_name);
        if user_id == 0 {
            return 0;
        }
        let completions: Vec<(SessionHandle, PendingAuth)> = self
            .connections
            .values()
            .filter(|conn| !conn.is_dead())
            .filter_map(|conn| {
                conn.take_pending_auth(user_name)
                    .map(|pending| (conn.clone(), pending))
            })
            .collect();
        let accepted = completions.len();
        for (conn, pending) in completions {
            self.complete_authorize(&conn, pending.rpc_id, user_id, &pending.user_name, &pending.worker_name);
        }
        accepted
    }

    /// Re-runs auto registration for every user name some session is still
    /// waiting on; called after the user list ingested fresh rows.
    pub fn retry_pending_auto_reg(&mut self) {
        let waiting: std::collections::HashSet<String> = self
            .connections
            .values()
            .filter_map(|conn| conn.pending_auth_user())
            .collect();
        for user_name in waiting {
            self.auto_reg_callback(&user_name);
        }
    }

    /// Resolves `mining.authorize` on the dispatch thread. Unknown users
    /// park the request and emit a registration event instead of failing.
    pub fn authorize_session(
        &mut self,
        handle: &SessionHandle,
        rpc_id: u64,
        user_name: &str,
        worker_name: &str,
    ) {
        if handle.is_dead() {
            return;
        }
        let user_id = self.user_directory.get_user_id(user_name);
        if user_id == 0 {
            info!(
                "session {:08x}: deferring authorize for unregistered user {}",
                handle.session_id(),
                user_name
            );
            handle.set_pending_auth(PendingAuth {
                rpc_id,
                user_name: user_name.to_string(),
                worker_name: worker_name.to_string(),
                miner_agent: handle.miner_agent(),
            });
            let event = json!({
                "created_at": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                "type": "auto_register",
                "content": {
                    "user_name": user_name,
                    "session_id": handle.session_id(),
                }
            });
            self.send_event(handle.chain_id(), &event.to_string());
            return;
        }
        self.complete_authorize(handle, rpc_id, user_id, user_name, worker_name);
    }

    fn complete_authorize(
        &mut self,
        handle: &SessionHandle,
        rpc_id: u64,
        user_id: u32,
        user_name: &str,
        worker_name: &str,
    ) {
        let worker_id = worker_id_of(worker_name);
        handle.set_user(user_name, user_id, worker_id);
        handle.respond(Message::ok_response(rpc_id, json!(true)));
        handle.respond(Message::set_difficulty(self.session_difficulty()));

        let chain_id = handle.chain_id();
        if let Some(record) = self
            .chains
            .get(chain_id)
            .and_then(|chain| chain.repository.get_latest())
        {
            handle.send_notify(&record);
        }

        self.user_directory.add_worker(WorkerName {
            chain_id,
            user_id,
            worker_id,
            worker_name: worker_name.to_string(),
            miner_agent: handle.miner_agent(),
        });

        let event = json!({
            "created_at": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "type": "miner_connect",
            "content": {
                "user_id": user_id,
                "user_name": user_name,
                "worker_name": worker_name,
                "client_agent": handle.miner_agent(),
                "session_id": handle.session_id(),
            }
        });
        self.send_event(chain_id, &event.to_string());
        info!(
            "session {:08x} authorized: user {} ({}), worker {}",
            handle.session_id(),
            user_name,
            user_id,
            worker_name
        );
    }

    fn session_difficulty(&self) -> u64 {
        if self.policy.enable_dev_mode {
            (self.policy.dev_fixed_difficulty.max(1.0)) as u64
        } else {
            self.difficulty.default_difficulty
        }
    }

    /// Resolves `mining.submit` against the job window and fires the share
    /// into the share log. Stale records follow the `accept_stale` policy.
    pub fn handle_submit(&mut self, handle: &SessionHandle, rpc_id: u64, job_id: u64) {
        if handle.is_dead() {
            return;
        }
        if handle.user_id() == 0 && !self.policy.enable_simulator {
            handle.respond(Message::err_response(
                rpc_id,
                stratum::ERR_UNAUTHORIZED,
                "unauthorized worker",
            ));
            return;
        }

        let chain_id = handle.chain_id();
        let Some(chain) = self.chains.get(chain_id) else {
            handle.respond(Message::err_response(
                rpc_id,
                stratum::ERR_JOB_NOT_FOUND,
                "Job not found (=stale)",
            ));
            return;
        };
        let chain_name = chain.name.clone();
        let record = chain.repository.get_by_id(job_id);

        let accept = match &record {
            Some(r) => self.policy.enable_simulator || !r.is_stale() || self.policy.accept_stale,
            None => self.policy.enable_simulator,
        };
        if !accept {
            self.metrics
                .shares_rejected
                .with_label_values(&[chain_name.as_str()])
                .inc();
            handle.respond(Message::err_response(
                rpc_id,
                stratum::ERR_JOB_NOT_FOUND,
                "Job not found (=stale)",
            ));
            return;
        }

        let share = json!({
            "jobId": job_id,
            "userId": handle.user_id(),
            "workerId": handle.worker_id(),
            "sessionId": handle.session_id(),
            "height": record.as_ref().map(|r| r.job().height()).unwrap_or(0),
            "time": now_unix(),
            "stale": record.as_ref().map(|r| r.is_stale()).unwrap_or(false),
        });
        let bytes = share.to_string();
        self.send_share(chain_id, bytes.as_bytes());
        if self.policy.enable_submit_invalid_block {
            // dev option: every share doubles as a block candidate
            self.send_solved_share(chain_id, bytes.as_bytes());
        }

        self.metrics
            .shares_accepted
            .with_label_values(&[chain_name.as_str()])
            .inc();
        handle.respond(Message::ok_response(rpc_id, json!(true)));
    }

    pub fn send_share(&self, chain_id: usize, data: &[u8]) {
        if let Some(chain) = self.chains.get(chain_id) {
            chain.share_log.produce(data);
        }
    }

    pub fn send_solved_share(&self, chain_id: usize, data: &[u8]) {
        if let Some(chain) = self.chains.get(chain_id) {
            chain.solved_share.produce(data);
        }
    }

    pub fn send_event(&self, chain_id: usize, message: &str) {
        if let Some(chain) = self.chains.get(chain_id) {
            chain.common_events.produce(message.as_bytes());
        }
    }
}
