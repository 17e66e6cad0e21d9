//! ## Status Reporting System
//!
//! This module defines how internal components of the server report health,
//! errors, and shutdown conditions back to the main runtime loop in `main.rs`.
//!
//! At the core, tasks send a [`Status`] (wrapping a [`State`]) through a
//! channel, tagged with a [`StatusSender`] to indicate the origin of the
//! message. This keeps error handling centralized: background tasks never
//! raise into the main loop directly, they report and the loop decides.

use crate::error::SserverError;

/// Whether the reporting task should keep running after an error.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorBranch {
    Break,
    Continue,
}

/// Identifies the component that originated a [`Status`] update.
#[derive(Debug, Clone)]
pub enum StatusSender {
    /// Sender for the TCP listener / event loop.
    Listener(async_channel::Sender<Status>),
    /// Sender for a per-chain job-bus consumer.
    JobConsumer {
        chain_id: usize,
        tx: async_channel::Sender<Status>,
    },
    /// Sender for the user directory updater.
    UserDirectory(async_channel::Sender<Status>),
    /// Sender for a miner session.
    Session {
        session_id: u32,
        tx: async_channel::Sender<Status>,
    },
}

impl StatusSender {
    async fn send(&self, status: Status) {
        let tx = match self {
            Self::Listener(tx) => tx,
            Self::JobConsumer { tx, .. } => tx,
            Self::UserDirectory(tx) => tx,
            Self::Session { tx, .. } => tx,
        };
        tx.send(status).await.unwrap_or(());
    }
}

/// The kind of event or status being reported by a task.
#[derive(Debug)]
pub enum State {
    /// The listener / event loop shut down.
    ListenerShutdown(SserverError),
    /// A job-bus consumer hit a fatal error; the whole server must go down
    /// rather than silently stop notifying miners.
    JobConsumerShutdown {
        chain_id: usize,
        error: SserverError,
    },
    /// The user directory updater shut down.
    UserDirectoryShutdown(SserverError),
    /// A miner session dropped; reclaimed by the next broadcast sweep.
    SessionDropped { session_id: u32 },
    /// Component is healthy.
    Healthy(String),
}

/// Wraps a status update, to be passed through a status channel.
#[derive(Debug)]
pub struct Status {
    pub state: State,
}

/// Centralized error dispatcher.
///
/// Decides whether the reporting task should `Continue` or `Break` based on
/// the error type and its source, and forwards the matching [`State`] to the
/// main loop.
pub async fn handle_error(sender: &StatusSender, e: SserverError) -> ErrorBranch {
    tracing::error!("Error: {:?}", &e);
    match sender {
        StatusSender::Listener(_) => {
            sender
                .send(Status {
                    state: State::ListenerShutdown(e),
                })
                .await;
            ErrorBranch::Break
        }
        StatusSender::JobConsumer { chain_id, .. } => match e {
            // transient consumer errors: poll timeouts and malformed
            // payloads are logged by the consumer loop itself
            SserverError::JobDecode(_) | SserverError::BadSerdeJson(_) => ErrorBranch::Continue,
            _ => {
                sender
                    .send(Status {
                        state: State::JobConsumerShutdown {
                            chain_id: *chain_id,
                            error: e,
                        },
                    })
                    .await;
                ErrorBranch::Break
            }
        },
        StatusSender::UserDirectory(_) => match e {
            // a failed HTTP poll keeps the previous map and retries
            SserverError::Http(_) | SserverError::BadSerdeJson(_) => ErrorBranch::Continue,
            _ => {
                sender
                    .send(Status {
                        state: State::UserDirectoryShutdown(e),
                    })
                    .await;
                ErrorBranch::Break
            }
        },
        StatusSender::Session { session_id, .. } => {
            // a session error never takes the server down
            sender
                .send(Status {
                    state: State::SessionDropped {
                        session_id: *session_id,
                    },
                })
                .await;
            ErrorBranch::Break
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_error_is_reported_as_dropped() {
        let (tx, rx) = async_channel::unbounded();
        let sender = StatusSender::Session { session_id: 7, tx };

        let branch = handle_error(&sender, SserverError::ChannelErrorSender).await;
        assert_eq!(branch, ErrorBranch::Break);

        match rx.recv().await.unwrap().state {
            State::SessionDropped { session_id } => assert_eq!(session_id, 7),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_consumer_error_continues() {
        let (tx, rx) = async_channel::unbounded();
        let sender = StatusSender::JobConsumer { chain_id: 0, tx };

        let branch = handle_error(&sender, SserverError::JobDecode("bad".into())).await;
        assert_eq!(branch, ErrorBranch::Continue);
        assert!(rx.try_recv().is_err());
    }
}
