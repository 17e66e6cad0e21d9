//! ## Stratum Server
//!
//! The owner value whose lifetime spans setup -> run -> drop: it builds the
//! per-chain resources (Kafka producers and job repositories), acquires the
//! server id, warms the user directory, binds the listener, and then runs
//! the event loop that owns every piece of mutable server state.

pub mod core;
pub mod session;
pub mod tls;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::SserverConfig;
use crate::error::{SserverError, SserverResult};
use crate::jobs::consumer::JobConsumerTask;
use crate::jobs::repository::JobRepository;
use crate::jobs::JsonJobDecoder;
use crate::kafka::{
    JobConsumer, KafkaProducer, COMMON_EVENTS_OPTIONS, SHARE_LOG_OPTIONS, SOLVED_SHARE_OPTIONS,
};
use crate::metrics::{self, ServerMetrics};
use crate::server::core::{
    ChainState, DispatchTask, Dispatcher, ServerCore, ServerPolicy, SESSION_ID_BITS,
};
use crate::server::session::{Session, SessionHandle};
use crate::session_id::SessionIdAllocator;
use crate::status::{Status, StatusSender};
use crate::task_manager::TaskManager;
use crate::users::UserDirectory;
use crate::zk;

const KAFKA_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StratumServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    core: ServerCore,
    dispatcher: Dispatcher,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchTask>,
    session_ids: Arc<SessionIdAllocator<SESSION_ID_BITS>>,
    user_directory: Arc<UserDirectory>,
    task_manager: Arc<TaskManager>,
    notify_shutdown: broadcast::Sender<()>,
    consumers_running: Arc<AtomicBool>,
    status_tx: async_channel::Sender<Status>,
    tcp_read_timeout: Duration,
}

impl StratumServer {
    /// Builds the whole server from a validated configuration. Every error
    /// here is fatal: a half-configured stratum server must not serve.
    pub async fn setup(
        config: SserverConfig,
        status_tx: async_channel::Sender<Status>,
    ) -> SserverResult<Self> {
        let validated = config.validate()?;
        let s = &config.sserver;

        // ------------------- server id -------------------
        let server_id = if s.id > 0 {
            s.id as u8
        } else {
            let brokers = config
                .zookeeper
                .as_ref()
                .map(|z| z.brokers.clone())
                .ok_or_else(|| SserverError::Config("zookeeper.brokers is missing".into()))?;
            let lock_path = s
                .zookeeper_lock_path
                .clone()
                .ok_or_else(|| {
                    SserverError::Config("sserver.zookeeper_lock_path is missing".into())
                })?;
            tokio::task::spawn_blocking(move || zk::acquire_server_id(&brokers, &lock_path))
                .await
                .map_err(|e| SserverError::General(format!("zookeeper task failed: {}", e)))??
        };
        info!("server id: {}", server_id);
        let session_ids = Arc::new(SessionIdAllocator::<SESSION_ID_BITS>::new(server_id));

        // ------------------- per-chain resources -------------------
        let mut chains = Vec::new();
        let mut consumer_tasks = Vec::new();
        for (chain_id, chain) in validated.chains.iter().enumerate() {
            let share_log =
                KafkaProducer::new(&chain.kafka_brokers, &chain.share_topic, SHARE_LOG_OPTIONS)?;
            let solved_share = KafkaProducer::new(
                &chain.kafka_brokers,
                &chain.solved_share_topic,
                SOLVED_SHARE_OPTIONS,
            )?;
            let common_events = KafkaProducer::new(
                &chain.kafka_brokers,
                &chain.common_events_topic,
                COMMON_EVENTS_OPTIONS,
            )?;
            for producer in [&share_log, &solved_share, &common_events] {
                producer.check_alive(KAFKA_ALIVE_TIMEOUT).map_err(|e| {
                    SserverError::Config(format!(
                        "kafka producer for chain {} topic {} is not alive: {}",
                        chain.name,
                        producer.topic(),
                        e
                    ))
                })?;
            }

            let consumer = JobConsumer::new(&chain.kafka_brokers, &chain.job_topic, 0)?;
            consumer.check_alive(KAFKA_ALIVE_TIMEOUT).map_err(|e| {
                SserverError::Config(format!(
                    "kafka job consumer for chain {} topic {} is not alive: {}",
                    chain.name, chain.job_topic, e
                ))
            })?;

            consumer_tasks.push(JobConsumerTask {
                chain_id,
                chain_name: chain.name.clone(),
                consumer,
                decoder: Arc::new(JsonJobDecoder),
                max_jobs_life_time: validated.max_job_lifetime,
            });
            chains.push(ChainState {
                name: chain.name.clone(),
                repository: JobRepository::new(
                    chain_id,
                    validated.max_job_lifetime,
                    s.mining_notify_interval,
                    chain.file_last_notify_time.clone(),
                ),
                share_log: Arc::new(share_log),
                solved_share: Arc::new(solved_share),
                common_events: Arc::new(common_events),
            });
            info!("chain {} ready: {}", chain_id, chain.name);
        }

        // ------------------- user directory -------------------
        let user_directory = Arc::new(UserDirectory::new(&config.users)?);
        user_directory.warm_up().await;

        // ------------------- listener -------------------
        let ip: IpAddr = if s.ip.is_empty() {
            IpAddr::from([0, 0, 0, 0])
        } else {
            s.ip
                .parse()
                .map_err(|_| SserverError::Config(format!("invalid ip: {}", s.ip)))?
        };
        let listen_addr = SocketAddr::new(ip, s.port);
        let listener = TcpListener::bind(listen_addr).await?;
        info!("listening on {}", listen_addr);

        let tls = match (s.enable_tls, &s.tls_cert_file, &s.tls_key_file) {
            (true, Some(cert), Some(key)) => {
                let acceptor = tls::build_tls_acceptor(cert, key)?;
                info!("TLS enabled");
                Some(acceptor)
            }
            (true, _, _) => {
                return Err(SserverError::Config(
                    "sserver.enable_tls requires tls_cert_file and tls_key_file".to_string(),
                ))
            }
            _ => None,
        };

        // ------------------- runtime wiring -------------------
        let (dispatcher, dispatch_rx) = Dispatcher::new();
        let (notify_shutdown, _) = broadcast::channel(4);
        let task_manager = Arc::new(TaskManager::new());
        let metrics = Arc::new(ServerMetrics::new()?);

        if config.prometheus.enabled {
            metrics::spawn_exporter(
                metrics.clone(),
                &config.prometheus,
                &notify_shutdown,
                &task_manager,
            )
            .await?;
        }

        let common_events: Vec<Arc<KafkaProducer>> =
            chains.iter().map(|c| c.common_events.clone()).collect();
        user_directory
            .clone()
            .spawn_tasks(dispatcher.clone(), common_events, &task_manager);

        let consumers_running = Arc::new(AtomicBool::new(true));
        for task in consumer_tasks {
            let sender = StatusSender::JobConsumer {
                chain_id: task.chain_id,
                tx: status_tx.clone(),
            };
            task.spawn(
                consumers_running.clone(),
                dispatcher.clone(),
                sender,
                &task_manager,
            );
        }

        let core = ServerCore::new(
            chains,
            session_ids.clone(),
            user_directory.clone(),
            validated.difficulty.clone(),
            ServerPolicy {
                accept_stale: s.accept_stale,
                enable_simulator: s.enable_simulator,
                enable_submit_invalid_block: s.enable_submit_invalid_block,
                enable_dev_mode: s.enable_dev_mode,
                dev_fixed_difficulty: s.dev_fixed_difficulty,
            },
            metrics,
        );

        Ok(Self {
            listener,
            tls,
            core,
            dispatcher,
            dispatch_rx,
            session_ids,
            user_directory,
            task_manager,
            notify_shutdown,
            consumers_running,
            status_tx,
            tcp_read_timeout: Duration::from_secs(s.tcp_read_timeout),
        })
    }

    /// Handle for posting tasks onto the event loop.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Cloning this sender is how the outside world stops the server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.notify_shutdown.clone()
    }

    /// The event loop: accepts connections, executes dispatched tasks in
    /// post order, exits on shutdown. Connection-table and job-window
    /// mutations happen only here.
    pub async fn run(self) {
        let StratumServer {
            listener,
            tls,
            mut core,
            dispatcher,
            mut dispatch_rx,
            session_ids,
            user_directory,
            task_manager,
            notify_shutdown,
            consumers_running,
            status_tx,
            tcp_read_timeout,
        } = self;
        let mut shutdown_rx = notify_shutdown.subscribe();

        info!("stratum server running");
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => accept_connection(
                        &mut core,
                        stream,
                        peer,
                        &tls,
                        &session_ids,
                        &dispatcher,
                        tcp_read_timeout,
                        &status_tx,
                        &notify_shutdown,
                        &task_manager,
                    ),
                    Err(e) => warn!("failed to accept new connection: {:?}", e),
                },
                Some(task) = dispatch_rx.recv() => task(&mut core),
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("stop stratum server");
        consumers_running.store(false, Ordering::Relaxed);
        user_directory.stop();
        // dropping the core drops the session handles, closing their
        // outgoing channels; the broadcast above unblocks their readers
        drop(core);
        task_manager.join_all().await;
        info!("stratum server stopped");
    }
}

/// Listener callback: allocate an id, tune the socket, spawn the session.
#[allow(clippy::too_many_arguments)]
fn accept_connection(
    core: &mut ServerCore,
    stream: TcpStream,
    peer: SocketAddr,
    tls: &Option<TlsAcceptor>,
    session_ids: &Arc<SessionIdAllocator<SESSION_ID_BITS>>,
    dispatcher: &Dispatcher,
    tcp_read_timeout: Duration,
    status_tx: &async_channel::Sender<Status>,
    notify_shutdown: &broadcast::Sender<()>,
    task_manager: &TaskManager,
) {
    let Some(session_id) = session_ids.alloc() else {
        // out of capacity: refuse the connection
        warn!("session ids exhausted, dropping connection from {}", peer);
        return;
    };
    if let Err(e) = stream.set_nodelay(true) {
        warn!("cannot set TCP_NODELAY for {}: {}", peer, e);
    }

    let (outgoing_tx, outgoing_rx) = async_channel::unbounded();
    let handle = SessionHandle::new(session_id, 0, outgoing_tx);
    info!("new connection from {}, session {:08x}", peer, session_id);

    Session::spawn(
        stream,
        peer,
        tls.clone(),
        handle.clone(),
        outgoing_rx,
        dispatcher.clone(),
        tcp_read_timeout,
        StatusSender::Session {
            session_id,
            tx: status_tx.clone(),
        },
        notify_shutdown,
        task_manager,
    );
    core.insert_connection(handle);
}
