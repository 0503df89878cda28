//! Scripted sender adapter for dispatcher tests
//!
//! Responses are consumed in order, one per send attempt; once the script
//! runs out the fallback response is used.
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use sendq_delivery::{
    DeliveryError, DispatcherState, OutboundMessage, PermanentError, Receipt, Sender, Signal,
    TemporaryError,
};
use tokio::sync::{Notify, broadcast, watch};

/// What the mock does for one send attempt
#[derive(Debug, Clone)]
pub enum Response {
    Accept,
    Confirm,
    Transient(String),
    Permanent(String),
    Panic,
}

#[derive(Debug, Default)]
struct Inner {
    script: VecDeque<Response>,
    sent: Vec<OutboundMessage>,
    states: Vec<DispatcherState>,
    observer: Option<watch::Receiver<DispatcherState>>,
}

#[derive(Debug)]
pub struct MockSender {
    inner: Mutex<Inner>,
    fallback: Response,
    shutdown_on_first_send: Option<broadcast::Sender<Signal>>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl MockSender {
    pub fn accepting() -> Self {
        Self::with_fallback(Response::Accept)
    }

    pub fn with_fallback(fallback: Response) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fallback,
            shutdown_on_first_send: None,
            gate: None,
        }
    }

    #[must_use]
    pub fn with_script(self, script: impl IntoIterator<Item = Response>) -> Self {
        self.inner.lock().unwrap().script = script.into_iter().collect();
        self
    }

    /// Broadcast a shutdown signal while the first message is being sent.
    #[must_use]
    pub fn signalling(mut self, shutdown: broadcast::Sender<Signal>) -> Self {
        self.shutdown_on_first_send = Some(shutdown);
        self
    }

    /// Hold every send until `release` is notified; `started` is notified
    /// when a send begins.
    #[must_use]
    pub fn gated(mut self, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some((started, release));
        self
    }

    /// Note the dispatcher's state at the start of every send.
    pub fn observe(&self, state: watch::Receiver<DispatcherState>) {
        self.inner.lock().unwrap().observer = Some(state);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Dispatcher state seen by each send, in order
    pub fn states(&self) -> Vec<DispatcherState> {
        self.inner.lock().unwrap().states.clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Sender for MockSender {
    async fn send(&self, message: &OutboundMessage) -> Result<Receipt, DeliveryError> {
        let (response, first) = {
            let mut inner = self.inner.lock().unwrap();
            inner.sent.push(message.clone());
            if let Some(state) = inner.observer.as_ref().map(|observer| *observer.borrow()) {
                inner.states.push(state);
            }
            let response = inner.script.pop_front().unwrap_or_else(|| self.fallback.clone());
            (response, inner.sent.len() == 1)
        };

        if first && let Some(shutdown) = &self.shutdown_on_first_send {
            let _ = shutdown.send(Signal::Shutdown);
        }

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }

        match response {
            Response::Accept => Ok(Receipt::Accepted),
            Response::Confirm => Ok(Receipt::Delivered),
            Response::Transient(reason) => Err(TemporaryError::ConnectionFailed(reason).into()),
            Response::Permanent(address) => Err(PermanentError::InvalidRecipient(address).into()),
            Response::Panic => panic!("mock sender exploded"),
        }
    }
}
