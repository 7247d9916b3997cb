//! Request/response correlation over a transport.
//!
//! A requester sends a request on one topic and collects responses carrying
//! the same id from another. Responders serve requests from a background
//! thread.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CorrelatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::marshaller::{JsonMarshaller, Marshaller};
use crate::transport::Transport;

/// Longest single wait before the cancel token is checked again.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// How many responses a request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    /// Return as soon as the first response arrives.
    #[default]
    One,
    /// Collect every response that arrives within the window.
    OneOrMore,
}

/// A message that can be matched to its responses.
pub trait Correlated: Serialize + DeserializeOwned + Send + 'static {
    /// Id shared by a request and all of its responses.
    fn correlation_id(&self) -> String;

    /// Fold a response into the request. Replaces it by default.
    fn merge(&mut self, response: Self)
    where
        Self: Sized,
    {
        *self = response;
    }
}

/// Consulted when the wait window ends; `true` extends it by one increment.
pub trait Waiter {
    fn wait_again(&self) -> bool;
}

impl<F: Fn() -> bool> Waiter for F {
    fn wait_again(&self) -> bool {
        self()
    }
}

/// Cancels a wait from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sends requests and waits for correlated responses.
pub struct RequestRequester<T> {
    request_topic: String,
    response_topic: String,
    transport: Arc<dyn Transport>,
    marshaller: Arc<dyn Marshaller>,
    config: CorrelatorConfig,
    increment: Duration,
    cancel: CancelToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Correlated> RequestRequester<T> {
    pub fn new(
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let config = CorrelatorConfig::default();
        Self {
            request_topic: request_topic.into(),
            response_topic: response_topic.into(),
            transport,
            marshaller: Arc::new(JsonMarshaller::new()),
            increment: config.timeout(),
            config,
            cancel: CancelToken::new(),
            _marker: PhantomData,
        }
    }

    /// Set the response type and timeout. The waiter increment follows the timeout.
    pub fn with_config(mut self, config: CorrelatorConfig) -> Self {
        self.increment = config.timeout();
        self.config = config;
        self
    }

    pub fn with_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }

    /// How far each `wait_again() == true` extends the window.
    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    /// Token that aborts the wait in progress with [`EngineError::Cancelled`].
    /// Every post starts uncancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Send a request and merge responses with [`Correlated::merge`].
    pub fn post(&self, request: T) -> EngineResult<T> {
        self.post_with(request, |request: &mut T, response| request.merge(response), None)
    }

    /// Send a request and merge responses with `merge`.
    ///
    /// With [`ResponseType::One`] this returns on the first response. With
    /// [`ResponseType::OneOrMore`] it waits out the whole window. Either way a
    /// window that ends with no response is a [`EngineError::Timeout`], after
    /// the waiter has been consulted and a last look for late arrivals.
    pub fn post_with<M>(
        &self,
        mut request: T,
        mut merge: M,
        waiter: Option<&dyn Waiter>,
    ) -> EngineResult<T>
    where
        M: FnMut(&mut T, T),
    {
        self.cancel.reset();
        let id = request.correlation_id();
        let sent = self.marshaller.marshal(&request)?;
        let subscription = self.transport.subscribe(&self.response_topic)?;
        self.transport.send(&self.request_topic, sent.clone())?;
        tracing::debug!("Posted request {} on {}", id, self.request_topic);

        let response_type = self.config.response_type;
        let started = Instant::now();
        let mut deadline = started + self.config.timeout();
        let mut received = 0usize;

        // On a shared topic the request itself comes back once.
        let mut skip_echo = self.request_topic == self.response_topic;
        let mut accept = |text: String, request: &mut T| -> bool {
            if skip_echo && text == sent {
                skip_echo = false;
                return false;
            }
            match self.marshaller.unmarshal::<T>(&text) {
                Ok(response) if response.correlation_id() == id => {
                    merge(request, response);
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!("Ignoring malformed response on {}: {}", self.response_topic, e);
                    false
                }
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                if waiter.is_some_and(|w| w.wait_again()) {
                    deadline = now + self.increment;
                    continue;
                }
                break;
            }
            let slice = (deadline - now).min(CANCEL_POLL);
            if let Some(text) = subscription.recv_timeout(slice)?
                && accept(text, &mut request)
            {
                received += 1;
                if response_type == ResponseType::One {
                    return Ok(request);
                }
            }
        }

        // Responses that landed between the last wait and the deadline still count.
        while let Some(text) = subscription.try_recv()? {
            if accept(text, &mut request) {
                received += 1;
                if response_type == ResponseType::One {
                    break;
                }
            }
        }

        if received == 0 {
            tracing::debug!("No response to request {} on {}", id, self.response_topic);
            return Err(EngineError::Timeout(started.elapsed()));
        }
        tracing::debug!("Request {} collected {} responses", id, received);
        Ok(request)
    }
}

/// Answers requests on a topic from a background thread.
pub struct RequestResponder {
    request_topic: String,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl RequestResponder {
    /// Subscribe to `request_topic` and answer every request with `respond`.
    ///
    /// `Ok(None)` sends nothing. Errors are logged and the responder keeps
    /// serving.
    pub fn spawn<T, F>(
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
        transport: Arc<dyn Transport>,
        respond: F,
    ) -> EngineResult<Self>
    where
        T: Correlated,
        F: Fn(T) -> EngineResult<Option<T>> + Send + 'static,
    {
        let request_topic = request_topic.into();
        let response_topic = response_topic.into();
        let marshaller: Arc<dyn Marshaller> = Arc::new(JsonMarshaller::new());
        let subscription = transport.subscribe(&request_topic)?;
        let stop = CancelToken::new();

        let token = stop.clone();
        let topic = request_topic.clone();
        let handle = thread::Builder::new()
            .name(format!("responder-{}", request_topic))
            .spawn(move || {
                while !token.is_cancelled() {
                    let text = match subscription.recv_timeout(CANCEL_POLL * 5) {
                        Ok(Some(text)) => text,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Responder on {} stopped: {}", topic, e);
                            break;
                        }
                    };
                    let reply = marshaller
                        .unmarshal::<T>(&text)
                        .and_then(&respond)
                        .and_then(|reply| reply.map(|r| marshaller.marshal(&r)).transpose());
                    match reply {
                        Ok(Some(reply)) => {
                            if let Err(e) = transport.send(&response_topic, reply) {
                                tracing::warn!("Failed to send response on {}: {}", response_topic, e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Failed to answer request on {}: {}", topic, e),
                    }
                }
            })
            .map_err(|e| EngineError::Internal(format!("Could not start responder: {}", e)))?;

        Ok(Self {
            request_topic,
            stop,
            handle: Some(handle),
        })
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Stop serving and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
