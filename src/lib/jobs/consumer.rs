//! Background job-bus consumer, one per chain.
//!
//! Polls the job topic with a 1-second timeout and feeds decoded jobs to the
//! dispatch loop. Whether or not a message arrived, every iteration posts
//! the periodic maintenance task (notify refresh + expiry sweep) so the
//! repository stays fresh even when the bus goes quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::SserverError;
use crate::kafka::JobConsumer;
use crate::server::core::Dispatcher;
use crate::status::{handle_error, StatusSender};
use crate::task_manager::TaskManager;
use crate::utils::now_unix;

use super::JobDecoder;

pub struct JobConsumerTask {
    pub chain_id: usize,
    pub chain_name: String,
    pub consumer: JobConsumer,
    pub decoder: Arc<dyn JobDecoder>,
    pub max_jobs_life_time: u64,
}

impl JobConsumerTask {
    pub fn spawn(
        self,
        running: Arc<AtomicBool>,
        dispatcher: Dispatcher,
        status_sender: StatusSender,
        task_manager: &TaskManager,
    ) {
        let name = format!("job consumer ({})", self.chain_name);
        task_manager.spawn(&name, async move {
            self.run(running, dispatcher, status_sender).await;
        });
    }

    async fn run(
        self,
        running: Arc<AtomicBool>,
        dispatcher: Dispatcher,
        status_sender: StatusSender,
    ) {
        info!("start job consumer for chain {}", self.chain_name);
        let poll_timeout = Duration::from_secs(1);

        while running.load(Ordering::Relaxed) {
            match self.consumer.poll(poll_timeout).await {
                None => {}
                Some(Ok(payload)) => self.consume(&payload, &dispatcher),
                Some(Err(e)) if JobConsumer::is_fatal(&e) => {
                    error!(
                        "consume fatal for topic {}: {}",
                        self.consumer.topic(),
                        e
                    );
                    handle_error(&status_sender, SserverError::Kafka(e)).await;
                    return;
                }
                Some(Err(e)) => {
                    warn!("consume error for topic {}: {}", self.consumer.topic(), e);
                }
            }

            let chain_id = self.chain_id;
            dispatcher.post(move |core| core.chain_maintenance(chain_id));
        }

        info!("stop job consumer for chain {}", self.chain_name);
    }

    fn consume(&self, payload: &[u8], dispatcher: &Dispatcher) {
        let job = match self.decoder.decode(payload) {
            Ok(job) => job,
            Err(e) => {
                error!("unserialize stratum job fail: {}", e);
                return;
            }
        };

        // reject jobs that sat on the bus for longer than a job lives
        let now = now_unix();
        if job.job_time() + self.max_jobs_life_time < now {
            error!(
                "too large delay from kafka to receive job: job time={}, max delay={}, now={}",
                job.job_time(),
                self.max_jobs_life_time,
                now
            );
            return;
        }

        let chain_id = self.chain_id;
        dispatcher.post(move |core| core.handle_incoming_job(chain_id, job));
    }
}
