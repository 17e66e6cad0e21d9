use sserver::config::SserverConfig;
use sserver::status::{State, Status};
use sserver::StratumServer;
use tracing::{error, info};

mod args {
    use std::path::PathBuf;

    #[derive(Debug)]
    pub struct Args {
        pub config_path: PathBuf,
    }

    enum ArgsState {
        Next,
        ExpectPath,
        Done,
    }

    enum ArgsResult {
        Config(PathBuf),
        None,
        Help(String),
    }

    impl Args {
        const DEFAULT_CONFIG_PATH: &'static str = "sserver-config.toml";

        pub fn from_args() -> Result<Self, String> {
            let cli_args = std::env::args();

            let config_path = cli_args
                .scan(ArgsState::Next, |state, item| {
                    match std::mem::replace(state, ArgsState::Done) {
                        ArgsState::Next => match item.as_str() {
                            "-c" | "--config" => {
                                *state = ArgsState::ExpectPath;
                                Some(ArgsResult::None)
                            }
                            "-h" | "--help" => Some(ArgsResult::Help(format!(
                                "Usage: -h/--help, -c/--config <path|default {}>",
                                Self::DEFAULT_CONFIG_PATH
                            ))),
                            _ => {
                                *state = ArgsState::Next;
                                Some(ArgsResult::None)
                            }
                        },
                        ArgsState::ExpectPath => Some(ArgsResult::Config(PathBuf::from(item))),
                        ArgsState::Done => None,
                    }
                })
                .last();
            let config_path = match config_path {
                Some(ArgsResult::Config(p)) => p,
                Some(ArgsResult::Help(h)) => return Err(h),
                _ => PathBuf::from(Self::DEFAULT_CONFIG_PATH),
            };
            Ok(Self { config_path })
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = match args::Args::from_args() {
        Ok(args) => args,
        Err(help) => {
            error!("{}", help);
            return;
        }
    };

    let config = match std::fs::read_to_string(&args.config_path) {
        Ok(raw) => match SserverConfig::from_toml(&raw) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to parse config: {}", e);
                return;
            }
        },
        Err(e) => {
            error!("failed to read config {:?}: {}", args.config_path, e);
            return;
        }
    };

    info!("sserver INITIALIZING with config: {:?}", &args.config_path);
    let (status_tx, status_rx) = async_channel::unbounded();

    let server = match StratumServer::setup(config, status_tx).await {
        Ok(server) => server,
        Err(e) => {
            error!("server setup failed: {}", e);
            return;
        }
    };

    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    // central status loop: background tasks report here instead of raising
    loop {
        let task_status = tokio::select! {
            task_status = status_rx.recv() => task_status,
            interrupt_signal = tokio::signal::ctrl_c() => {
                match interrupt_signal {
                    Ok(()) => info!("Interrupt received"),
                    Err(err) => error!("Unable to listen for interrupt signal: {}", err),
                }
                break;
            }
        };
        let Ok(Status { state }) = task_status else {
            break;
        };

        match state {
            State::ListenerShutdown(err) => {
                error!("SHUTDOWN from listener: {}", err);
                break;
            }
            State::JobConsumerShutdown { chain_id, error } => {
                error!("SHUTDOWN from job consumer (chain {}): {}", chain_id, error);
                break;
            }
            State::UserDirectoryShutdown(err) => {
                error!("SHUTDOWN from user directory: {}", err);
                break;
            }
            State::SessionDropped { session_id } => {
                info!("session {:08x} dropped", session_id);
            }
            State::Healthy(msg) => {
                info!("HEALTHY message: {}", msg);
            }
        }
    }

    let _ = shutdown.send(());
    let _ = server_task.await;
}
