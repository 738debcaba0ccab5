//! Shared test fixtures: an in-memory transport and a manual scheduler

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wamp_client::{
    ConnectionConfig, Dict, Id, Message, Result, ScheduledTask, Scheduler, Transport,
    TransportFactory, TransportHandlers, WampError,
};

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn dict(value: Value) -> Dict {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// Transport that records sent messages and lets the test drive its events
#[derive(Default)]
pub struct MockTransport {
    handlers: TransportHandlers,
    connected: AtomicBool,
    closed: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    sent: Mutex<Vec<Message>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the link coming up
    pub fn emit_open(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.handlers.opened();
    }

    /// Simulate an inbound message in array-of-fields form
    pub fn emit(&self, payload: Value) {
        match payload {
            Value::Array(list) => self.handlers.received(list),
            other => panic!("payload must be an array: {other}"),
        }
    }

    /// Simulate the link going down; reported at most once
    pub fn emit_close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handlers.closed(reason.to_string());
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn last_sent(&self) -> Option<Message> {
        self.sent.lock().last().cloned()
    }

    /// Request id of the last SUBSCRIBE, UNSUBSCRIBE or PUBLISH sent
    pub fn last_request(&self) -> Id {
        match self.last_sent() {
            Some(Message::Subscribe { request, .. })
            | Some(Message::Unsubscribe { request, .. })
            | Some(Message::Publish { request, .. }) => request,
            other => panic!("last message is not a request: {other:?}"),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn handlers(&self) -> &TransportHandlers {
        &self.handlers
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.emit_close("Disconnected");
        true
    }

    fn send(&self, message: &Message) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(WampError::NotConnected);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Factory handing out a new [`MockTransport`] per connection attempt
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn get(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock()[index].clone()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, _config: &ConnectionConfig) -> Arc<dyn Transport> {
        let transport = MockTransport::new();
        self.transports.lock().push(transport.clone());
        transport
    }
}

/// Scheduler that records delays and runs tasks only when told to
#[derive(Default)]
pub struct ManualScheduler {
    delays: Mutex<Vec<Duration>>,
    tasks: Mutex<VecDeque<ScheduledTask>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every delay ever scheduled, in order
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run the oldest scheduled task; false if none is waiting
    pub fn run_next(&self) -> bool {
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("delays", &self.delays.lock())
            .field("pending", &self.tasks.lock().len())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.delays.lock().push(delay);
        self.tasks.lock().push_back(task);
    }
}

/// Config wired to the given mock factory and scheduler
pub fn mock_config(factory: &Arc<MockFactory>, scheduler: &Arc<ManualScheduler>) -> ConnectionConfig {
    ConnectionConfig::new("ws://127.0.0.1:8080/ws", "realm1")
        .transport(factory.clone())
        .scheduler(scheduler.clone())
}
