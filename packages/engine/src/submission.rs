//! Listener that feeds beans arriving on a queue's submit topic into its
//! consumer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use queue_core::Bean;

use crate::consumer::Consumer;
use crate::correlator::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::marshaller::Marshaller;
use crate::transport::Transport;

const LISTEN_POLL: Duration = Duration::from_millis(50);

/// Submits every bean published on the consumer's submit topic.
///
/// Malformed messages and rejected beans are logged and skipped.
pub struct SubmissionListener {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl SubmissionListener {
    pub fn spawn(
        consumer: Arc<Consumer>,
        transport: Arc<dyn Transport>,
        marshaller: Arc<dyn Marshaller>,
    ) -> EngineResult<Self> {
        let topic = consumer.config().submit_topic.clone();
        let subscription = transport.subscribe(&topic)?;
        let stop = CancelToken::new();
        let token = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("submit-{}", consumer.name()))
            .spawn(move || {
                while !token.is_cancelled() {
                    let text = match subscription.recv_timeout(LISTEN_POLL) {
                        Ok(Some(text)) => text,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Submission listener on {} stopped: {}", topic, e);
                            break;
                        }
                    };
                    let bean: Bean = match marshaller.unmarshal(&text) {
                        Ok(bean) => bean,
                        Err(e) => {
                            tracing::warn!("Ignoring malformed bean on {}: {}", topic, e);
                            continue;
                        }
                    };
                    let name = bean.name.clone();
                    match consumer.submit(bean) {
                        Ok(id) => tracing::debug!("Submitted {} ({}) from {}", name, id, topic),
                        Err(e) => tracing::warn!("Rejected bean {} from {}: {}", name, topic, e),
                    }
                }
            })
            .map_err(|e| {
                EngineError::Internal(format!("Could not start submission listener: {}", e))
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop listening and wait for the listener thread.
    pub fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SubmissionListener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
