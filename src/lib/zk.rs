//! Server-id acquisition from ZooKeeper.
//!
//! When `sserver.id` is 0 the server claims a unique 8-bit id by creating an
//! ephemeral node named after the id under the configured lock path. The
//! node disappears with the session, so a crashed server frees its id.

use std::time::Duration;

use tracing::info;
use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZooKeeper};

use crate::error::{SserverError, SserverResult};

struct NoopWatcher;

impl Watcher for NoopWatcher {
    fn handle(&self, _event: WatchedEvent) {}
}

/// Claims the first free id in `1..=255` under `lock_path`. Fatal when the
/// brokers are unreachable or every id is taken; both are configuration
/// problems.
pub fn acquire_server_id(brokers: &str, lock_path: &str) -> SserverResult<u8> {
    let zk = ZooKeeper::connect(brokers, Duration::from_secs(10), NoopWatcher)?;
    ensure_path(&zk, lock_path)?;

    for id in 1..=255u32 {
        let node = format!("{}/{}", lock_path.trim_end_matches('/'), id);
        match zk.create(
            &node,
            Vec::new(),
            Acl::open_unsafe().clone(),
            CreateMode::Ephemeral,
        ) {
            Ok(_) => {
                info!("acquired server id {} from zookeeper ({})", id, node);
                return Ok(id as u8);
            }
            Err(ZkError::NodeExists) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(SserverError::Config(format!(
        "no free server id under {}",
        lock_path
    )))
}

fn ensure_path(zk: &ZooKeeper, path: &str) -> SserverResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match zk.create(
            &current,
            Vec::new(),
            Acl::open_unsafe().clone(),
            CreateMode::Persistent,
        ) {
            Ok(_) | Err(ZkError::NodeExists) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
