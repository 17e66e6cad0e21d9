//! Per-connection session actor.
//!
//! A session is one miner TCP (optionally TLS) connection: a reader task
//! framing line-delimited JSON and a writer task draining the outgoing
//! queue. The [`SessionHandle`] is what the server's connection table holds;
//! all table mutation stays on the dispatch loop, the I/O tasks only flip
//! the shared dead flag and post dispatch tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::status::{handle_error, StatusSender};
use crate::stratum::{self, Message};
use crate::task_manager::TaskManager;
use crate::{error::SserverError, server::core::Dispatcher};

const MAX_LINE_LENGTH: usize = 1 << 16;

pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// An authorize request parked until the user list knows the name.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub rpc_id: u64,
    pub user_name: String,
    pub worker_name: String,
    pub miner_agent: String,
}

#[derive(Debug)]
struct SessionShared {
    session_id: u32,
    chain_id: AtomicUsize,
    dead: AtomicBool,
    user_id: AtomicU32,
    worker_id: AtomicU64,
    user_name: StdRwLock<Option<String>>,
    miner_agent: StdRwLock<String>,
    pending_auth: StdMutex<Option<PendingAuth>>,
    outgoing: async_channel::Sender<Message>,
}

/// Cheaply clonable view of a session, held by the connection table and by
/// the session's own I/O tasks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn new(session_id: u32, chain_id: usize, outgoing: async_channel::Sender<Message>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                session_id,
                chain_id: AtomicUsize::new(chain_id),
                dead: AtomicBool::new(false),
                user_id: AtomicU32::new(0),
                worker_id: AtomicU64::new(0),
                user_name: StdRwLock::new(None),
                miner_agent: StdRwLock::new(String::new()),
                pending_auth: StdMutex::new(None),
                outgoing,
            }),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.shared.session_id
    }

    pub fn chain_id(&self) -> usize {
        self.shared.chain_id.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Relaxed)
    }

    pub fn mark_dead(&self) {
        self.shared.dead.store(true, Ordering::Relaxed);
    }

    pub fn user_id(&self) -> u32 {
        self.shared.user_id.load(Ordering::Relaxed)
    }

    pub fn worker_id(&self) -> u64 {
        self.shared.worker_id.load(Ordering::Relaxed)
    }

    pub fn user_name(&self) -> Option<String> {
        self.shared.user_name.read().ok().and_then(|n| n.clone())
    }

    pub fn miner_agent(&self) -> String {
        self.shared
            .miner_agent
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn set_miner_agent(&self, agent: &str) {
        if let Ok(mut slot) = self.shared.miner_agent.write() {
            *slot = agent.to_string();
        }
    }

    pub fn set_user(&self, user_name: &str, user_id: u32, worker_id: u64) {
        if let Ok(mut name) = self.shared.user_name.write() {
            *name = Some(user_name.to_string());
        }
        self.shared.user_id.store(user_id, Ordering::Relaxed);
        self.shared.worker_id.store(worker_id, Ordering::Relaxed);
    }

    pub fn set_pending_auth(&self, pending: PendingAuth) {
        if let Ok(mut slot) = self.shared.pending_auth.lock() {
            *slot = Some(pending);
        }
    }

    pub fn pending_auth_user(&self) -> Option<String> {
        self.shared
            .pending_auth
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.user_name.clone()))
    }

    /// Takes the parked authorize request if it is for `user_name`.
    pub fn take_pending_auth(&self, user_name: &str) -> Option<PendingAuth> {
        let mut slot = self.shared.pending_auth.lock().ok()?;
        if slot
            .as_ref()
            .is_some_and(|p| p.user_name.eq_ignore_ascii_case(user_name))
        {
            slot.take()
        } else {
            None
        }
    }

    /// Queues a message for the writer task. A closed channel means the
    /// writer is gone, so the session is as good as dead.
    pub fn respond(&self, message: Message) {
        if self.shared.outgoing.try_send(message).is_err() {
            self.mark_dead();
        }
    }

    pub fn send_notify(&self, record: &Arc<crate::jobs::JobRecord>) {
        let params = json!([record.job().payload(), record.is_clean()]);
        self.respond(Message::notify(params));
    }

    /// Chain-switch hook: repoint the session and hand it the new chain's
    /// freshest work right away.
    pub fn switch_chain(&self, new_chain_id: usize, latest: Option<&Arc<crate::jobs::JobRecord>>) {
        self.shared.chain_id.store(new_chain_id, Ordering::Relaxed);
        if let Some(record) = latest {
            self.send_notify(record);
        }
    }
}

pub struct Session;

impl Session {
    /// Spawns the reader and writer tasks for an accepted socket.
    ///
    /// Runs on the event loop; the TLS handshake (when enabled) happens
    /// inside the spawned task so a slow handshake cannot stall accepts.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        handle: SessionHandle,
        outgoing_rx: async_channel::Receiver<Message>,
        dispatcher: Dispatcher,
        tcp_read_timeout: Duration,
        status_sender: StatusSender,
        notify_shutdown: &broadcast::Sender<()>,
        task_manager: &TaskManager,
    ) {
        let session_id = handle.session_id();
        let mut reader_shutdown = notify_shutdown.subscribe();
        let writer_shutdown = notify_shutdown.subscribe();

        task_manager.spawn(&format!("session {:08x}", session_id), async move {
            let stream: Box<dyn SessionStream> = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => Box::new(tls_stream),
                    Err(e) => {
                        info!("TLS accept from {} failed: {}", peer, e);
                        handle.mark_dead();
                        return;
                    }
                },
                None => Box::new(stream),
            };
            let (read_half, write_half) = tokio::io::split(stream);

            let writer_handle = handle.clone();
            let writer = tokio::spawn(Self::run_writer(
                write_half,
                outgoing_rx,
                writer_handle,
                writer_shutdown,
            ));

            let mut lines = FramedRead::new(
                BufReader::new(read_half),
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            );
            loop {
                tokio::select! {
                    result = tokio::time::timeout(tcp_read_timeout, lines.next()) => {
                        match result {
                            Err(_) => {
                                info!("session {:08x}: socket read timeout", session_id);
                                break;
                            }
                            Ok(None) => {
                                debug!("session {:08x}: socket closed", session_id);
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                info!("session {:08x}: got an error on the socket: {}", session_id, e);
                                break;
                            }
                            Ok(Some(Ok(line))) => Self::handle_line(&handle, &dispatcher, &line),
                        }
                    }
                    _ = reader_shutdown.recv() => break,
                }
            }

            handle.mark_dead();
            let _ = writer.await;
            handle_error(&status_sender, SserverError::Shutdown).await;
        });
    }

    async fn run_writer(
        write_half: tokio::io::WriteHalf<Box<dyn SessionStream>>,
        outgoing_rx: async_channel::Receiver<Message>,
        handle: SessionHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut writer = BufWriter::new(write_half);
        loop {
            tokio::select! {
                message = outgoing_rx.recv() => {
                    let Ok(message) = message else {
                        break; // handle erased from the connection table
                    };
                    let line = match serde_json::to_string(&message) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("failed to serialize message: {:?}", e);
                            continue;
                        }
                    };
                    let data = format!("{}\n", line);
                    if writer.write_all(data.as_bytes()).await.is_err()
                        || writer.flush().await.is_err()
                    {
                        handle.mark_dead();
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Parses one wire line and routes it. State mutations that touch the
    /// job window or the user directory go through the dispatcher.
    fn handle_line(handle: &SessionHandle, dispatcher: &Dispatcher, line: &str) {
        let message = match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(e) => {
                debug!("failed to deserialize message: {:?}", e);
                return;
            }
        };
        let Message::StandardRequest(request) = message else {
            return;
        };

        match request.method.as_str() {
            "mining.subscribe" => {
                let miner_agent = request.params[0].as_str().unwrap_or("unknown").to_string();
                Self::handle_subscribe(handle, request.id, miner_agent);
            }
            "mining.authorize" => {
                let Some(full_name) = request.params[0].as_str() else {
                    handle.respond(Message::err_response(
                        request.id,
                        stratum::ERR_UNAUTHORIZED,
                        "invalid user name",
                    ));
                    return;
                };
                let (user, worker) = match full_name.split_once('.') {
                    Some((user, worker)) if !worker.is_empty() => (user, worker),
                    _ => (full_name, "default"),
                };
                let handle = handle.clone();
                let rpc_id = request.id;
                let user = user.to_string();
                let worker = worker.to_string();
                dispatcher.post(move |core| {
                    core.authorize_session(&handle, rpc_id, &user, &worker);
                });
            }
            "mining.submit" => {
                let Some(job_id) = parse_job_id(&request.params) else {
                    handle.respond(Message::err_response(
                        request.id,
                        stratum::ERR_JOB_NOT_FOUND,
                        "Job not found (=stale)",
                    ));
                    return;
                };
                let handle = handle.clone();
                let rpc_id = request.id;
                dispatcher.post(move |core| {
                    core.handle_submit(&handle, rpc_id, job_id);
                });
            }
            "mining.extranonce.subscribe" => {
                handle.respond(Message::ok_response(request.id, json!(true)));
            }
            "mining.configure" => {
                handle.respond(Message::ok_response(request.id, json!({})));
            }
            _ => {
                handle.respond(Message::err_response(
                    request.id,
                    stratum::ERR_UNKNOWN_METHOD,
                    "unknown method",
                ));
            }
        }
    }

    fn handle_subscribe(handle: &SessionHandle, rpc_id: u64, miner_agent: String) {
        handle.set_miner_agent(&miner_agent);
        // the session id doubles as the extranonce prefix; dense unique ids
        // keep extranonces collision-free across the whole pool
        let extranonce1 = format!("{:08x}", handle.session_id());
        let result = json!([
            [
                ["mining.set_difficulty", extranonce1.clone()],
                ["mining.notify", extranonce1.clone()]
            ],
            extranonce1,
            8
        ]);
        handle.respond(Message::ok_response(rpc_id, result));
    }
}

fn parse_job_id(params: &Value) -> Option<u64> {
    let raw = params.get(1)?;
    if let Some(n) = raw.as_u64() {
        return Some(n);
    }
    let s = raw.as_str()?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Stable worker id derived from the worker name, the same way the share
/// log keys workers.
pub fn worker_id_of(worker_name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    worker_name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_tracks_liveness_and_user() {
        let (tx, _rx) = async_channel::unbounded();
        let handle = SessionHandle::new(0x0700_0001, 0, tx);

        assert!(!handle.is_dead());
        assert_eq!(handle.user_id(), 0);

        handle.set_user("alice", 42, worker_id_of("rig1"));
        assert_eq!(handle.user_name().as_deref(), Some("alice"));
        assert_eq!(handle.user_id(), 42);

        handle.mark_dead();
        assert!(handle.is_dead());
    }

    #[test]
    fn test_pending_auth_matches_case_insensitively() {
        let (tx, _rx) = async_channel::unbounded();
        let handle = SessionHandle::new(1, 0, tx);
        handle.set_pending_auth(PendingAuth {
            rpc_id: 5,
            user_name: "Alice".to_string(),
            worker_name: "rig1".to_string(),
            miner_agent: "cgminer".to_string(),
        });

        assert!(handle.take_pending_auth("bob").is_none());
        let pending = handle.take_pending_auth("alice").unwrap();
        assert_eq!(pending.rpc_id, 5);
        // taken exactly once
        assert!(handle.take_pending_auth("alice").is_none());
    }

    #[test]
    fn test_respond_to_closed_channel_marks_dead() {
        let (tx, rx) = async_channel::unbounded();
        let handle = SessionHandle::new(2, 0, tx);
        drop(rx);
        handle.respond(Message::ok_response(1, json!(true)));
        assert!(handle.is_dead());
    }

    #[test]
    fn test_parse_job_id_accepts_hex_and_numbers() {
        assert_eq!(
            parse_job_id(&json!(["worker", "68adf3a500000001", "00", "0"])),
            Some(0x68ad_f3a5_0000_0001)
        );
        assert_eq!(parse_job_id(&json!(["worker", 12345])), Some(12345));
        assert_eq!(parse_job_id(&json!(["worker", "zz"])), None);
        assert_eq!(parse_job_id(&json!(["worker"])), None);
    }

    #[test]
    fn test_worker_id_is_stable() {
        assert_eq!(worker_id_of("rig1"), worker_id_of("rig1"));
        assert_ne!(worker_id_of("rig1"), worker_id_of("rig2"));
    }

    #[tokio::test]
    async fn test_subscribe_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer) = listener.accept().await.unwrap();

        let (dispatcher, _dispatch_rx) = Dispatcher::new();
        let (status_tx, _status_rx) = async_channel::unbounded();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task_manager = TaskManager::new();
        let (outgoing_tx, outgoing_rx) = async_channel::unbounded();
        let handle = SessionHandle::new(0x0700_0001, 0, outgoing_tx);

        Session::spawn(
            server_stream,
            peer,
            None,
            handle.clone(),
            outgoing_rx,
            dispatcher,
            Duration::from_secs(5),
            StatusSender::Session {
                session_id: handle.session_id(),
                tx: status_tx,
            },
            &shutdown_tx,
            &task_manager,
        );

        let (client_read, mut client_write) = client.into_split();
        client_write
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test/1.0\"]}\n")
            .await
            .unwrap();

        let mut lines = FramedRead::new(BufReader::new(client_read), LinesCodec::new());
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match serde_json::from_str::<Message>(&line).unwrap() {
            Message::Response(response) => {
                assert_eq!(response.id, 1);
                // the session id is the extranonce prefix
                assert_eq!(response.result[1], "07000001");
                assert!(response.error.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(handle.miner_agent(), "test/1.0");

        drop(client_write);
        drop(lines);
        let _ = shutdown_tx.send(());
        task_manager.join_all().await;
        assert!(handle.is_dead());
    }
}
