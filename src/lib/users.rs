//! ## User Directory
//!
//! Incrementally refreshed mapping from user name to numeric user id, fed by
//! the pool's user-list HTTP API, plus the deferred worker-registration
//! event writer.
//!
//! Two background tasks: the updater polls the API every 10 seconds for
//! users above the last seen id; the writer drains the worker-name queue
//! into the common-events stream. Emit happens before pop so a failed emit
//! leaves the entry queued.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::UsersSection;
use crate::error::{SserverError, SserverResult};
use crate::kafka::KafkaProducer;
use crate::server::core::Dispatcher;
use crate::task_manager::TaskManager;
use crate::utils::now_unix;

const UPDATE_INTERVAL_SECS: u64 = 10;

/// A worker registration waiting to be written to the event stream.
#[derive(Debug, Clone)]
pub struct WorkerName {
    pub chain_id: usize,
    pub user_id: u32,
    pub worker_id: u64,
    pub worker_name: String,
    pub miner_agent: String,
}

pub struct UserDirectory {
    api_url: String,
    case_insensitive: bool,
    user_defined_coinbase: bool,
    client: reqwest::Client,
    name_ids: StdRwLock<HashMap<String, u32>>,
    last_max_user_id: AtomicU32,
    last_time: AtomicU64,
    worker_queue: StdMutex<VecDeque<WorkerName>>,
    running: AtomicBool,
}

impl UserDirectory {
    pub fn new(config: &UsersSection) -> SserverResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_url: config.list_id_api_url.clone(),
            case_insensitive: config.case_insensitive,
            user_defined_coinbase: config.user_defined_coinbase,
            client,
            name_ids: StdRwLock::new(HashMap::new()),
            last_max_user_id: AtomicU32::new(0),
            last_time: AtomicU64::new(0),
            worker_queue: StdMutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Blocks setup until the directory has caught up with the API, so the
    /// first sessions to arrive can already resolve their users.
    pub async fn warm_up(&self) {
        loop {
            match self.incremental_update().await {
                Ok(0) => break,
                Ok(ingested) => debug!("user list warm-up: {} users", ingested),
                Err(e) => {
                    warn!("user list warm-up failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(
            "user directory warm: {} users, max id {}",
            self.len(),
            self.last_max_user_id.load(Ordering::Relaxed)
        );
    }

    /// One poll of `apiUrl?last_id=N`; returns how many entries it ingested.
    pub async fn incremental_update(&self) -> SserverResult<usize> {
        let mut url = format!(
            "{}?last_id={}",
            self.api_url,
            self.last_max_user_id.load(Ordering::Relaxed)
        );
        if self.user_defined_coinbase {
            url.push_str(&format!(
                "&last_time={}",
                self.last_time.load(Ordering::Relaxed)
            ));
        }

        let body: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let users = body
            .get("data")
            .and_then(|data| data.get("users"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                SserverError::General("user list response missing data.users".to_string())
            })?;
        Ok(self.ingest(users))
    }

    /// Upserts one API page into the map. Entries are either `name: id` or
    /// `name: {puid, coinbase}` depending on the pool variant.
    pub(crate) fn ingest(&self, users: &Map<String, Value>) -> usize {
        let mut ingested = 0;
        let mut max_id = self.last_max_user_id.load(Ordering::Relaxed);
        {
            let Ok(mut name_ids) = self.name_ids.write() else {
                return 0;
            };
            for (name, value) in users {
                let id = value
                    .as_u64()
                    .or_else(|| value.get("puid").and_then(Value::as_u64));
                let Some(id) = id else {
                    warn!("user list entry `{}` has no usable id", name);
                    continue;
                };
                let id = id as u32;
                if id == 0 {
                    continue;
                }
                let key = if self.case_insensitive {
                    name.to_lowercase()
                } else {
                    name.clone()
                };
                name_ids.insert(key, id);
                max_id = max_id.max(id);
                ingested += 1;
            }
        }
        self.last_max_user_id.fetch_max(max_id, Ordering::Relaxed);
        self.last_time.store(now_unix(), Ordering::Relaxed);
        ingested
    }

    /// `0` means "not found". The query is case-folded under the same rule
    /// as the stored keys.
    pub fn get_user_id(&self, name: &str) -> u32 {
        let key = if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        };
        self.name_ids
            .read()
            .ok()
            .and_then(|m| m.get(&key).copied())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.name_ids.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_max_user_id(&self) -> u32 {
        self.last_max_user_id.load(Ordering::Relaxed)
    }

    pub fn add_worker(&self, worker: WorkerName) {
        if let Ok(mut queue) = self.worker_queue.lock() {
            queue.push_back(worker);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Starts the updater and worker-name writer tasks. `common_events` is
    /// indexed by chain id; the writer falls back to chain 0 for events from
    /// chains that disappeared.
    pub fn spawn_tasks(
        self: Arc<Self>,
        dispatcher: Dispatcher,
        common_events: Vec<Arc<KafkaProducer>>,
        task_manager: &TaskManager,
    ) {
        let updater = self.clone();
        let updater_dispatcher = dispatcher;
        task_manager.spawn("user directory updater", async move {
            info!("start user directory updater");
            'outer: loop {
                for _ in 0..UPDATE_INTERVAL_SECS {
                    if !updater.running.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                match updater.incremental_update().await {
                    Ok(0) => {}
                    Ok(ingested) => {
                        debug!("user list update: {} users", ingested);
                        updater_dispatcher.post(|core| core.retry_pending_auto_reg());
                    }
                    Err(e) => warn!("incremental update users fail: {}", e),
                }
            }
            info!("stop user directory updater");
        });

        let writer = self;
        task_manager.spawn("worker name writer", async move {
            info!("start worker name writer");
            while writer.running.load(Ordering::Relaxed) {
                let front = writer
                    .worker_queue
                    .lock()
                    .ok()
                    .and_then(|queue| queue.front().cloned());
                let Some(worker) = front else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                };

                let producer = common_events
                    .get(worker.chain_id)
                    .or_else(|| common_events.first());
                if let Some(producer) = producer {
                    producer.produce(worker_update_event(&worker).to_string().as_bytes());
                }
                // pop only after the emit went out
                if let Ok(mut queue) = writer.worker_queue.lock() {
                    queue.pop_front();
                }
            }
            info!("stop worker name writer");
        });
    }
}

fn worker_update_event(worker: &WorkerName) -> Value {
    json!({
        "created_at": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        "type": "worker_update",
        "content": {
            "user_id": worker.user_id,
            "worker_id": worker.worker_id,
            "worker_name": worker.worker_name,
            "miner_agent": worker.miner_agent,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(case_insensitive: bool) -> UserDirectory {
        UserDirectory::new(&UsersSection {
            list_id_api_url: "http://127.0.0.1:1/userlist".to_string(),
            case_insensitive,
            user_defined_coinbase: false,
        })
        .unwrap()
    }

    fn as_map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_ingest_plain_and_object_entries() {
        let dir = directory(true);
        let ingested = dir.ingest(&as_map(json!({
            "alice": 1,
            "Bob": {"puid": 2, "coinbase": "bob"},
            "broken": "nope",
            "zero": 0,
        })));
        assert_eq!(ingested, 2);
        assert_eq!(dir.get_user_id("alice"), 1);
        assert_eq!(dir.get_user_id("bob"), 2);
        assert_eq!(dir.get_user_id("broken"), 0);
        assert_eq!(dir.get_user_id("zero"), 0);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let dir = directory(true);
        dir.ingest(&as_map(json!({"Alice": 5})));
        assert_eq!(dir.get_user_id("ALICE"), dir.get_user_id("alice"));
        assert_eq!(dir.get_user_id("AlIcE"), 5);
    }

    #[test]
    fn test_case_sensitive_mode_keeps_spelling() {
        let dir = directory(false);
        dir.ingest(&as_map(json!({"Alice": 5})));
        assert_eq!(dir.get_user_id("Alice"), 5);
        assert_eq!(dir.get_user_id("alice"), 0);
    }

    #[test]
    fn test_last_max_user_id_is_monotonic() {
        let dir = directory(true);
        dir.ingest(&as_map(json!({"a": 10, "b": 30})));
        assert_eq!(dir.last_max_user_id(), 30);

        // a later page with only smaller ids must not move the cursor back
        dir.ingest(&as_map(json!({"c": 20})));
        assert_eq!(dir.last_max_user_id(), 30);
        assert_eq!(dir.get_user_id("c"), 20);
    }

    #[test]
    fn test_upsert_overwrites_existing_user() {
        let dir = directory(true);
        dir.ingest(&as_map(json!({"alice": 1})));
        dir.ingest(&as_map(json!({"alice": 9})));
        assert_eq!(dir.get_user_id("alice"), 9);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_worker_queue_order() {
        let dir = directory(true);
        for i in 0..3u32 {
            dir.add_worker(WorkerName {
                chain_id: 0,
                user_id: i,
                worker_id: i as u64,
                worker_name: format!("rig{}", i),
                miner_agent: "test".to_string(),
            });
        }
        let queue = dir.worker_queue.lock().unwrap();
        let order: Vec<u32> = queue.iter().map(|w| w.user_id).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_worker_update_event_shape() {
        let event = worker_update_event(&WorkerName {
            chain_id: 0,
            user_id: 7,
            worker_id: 99,
            worker_name: "rig1".to_string(),
            miner_agent: "cgminer/4.10".to_string(),
        });
        assert_eq!(event["type"], "worker_update");
        assert_eq!(event["content"]["user_id"], 7);
        assert_eq!(event["content"]["worker_name"], "rig1");
        assert!(event["created_at"].is_string());
    }
}
