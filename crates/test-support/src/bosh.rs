//! Scripted in-process BOSH transport.
//!
//! [`FakeBosh`] is a [`BoshClientFactory`]. Every client it creates feeds sent
//! bodies to a script, and the script's replies are delivered to the
//! registered listeners on a dedicated worker thread, the way a real HTTP
//! client reports responses from its own threads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use tracing::trace;
use waddle_bosh::body::{ComposableBody, SID, VERSION};
use waddle_bosh::{
    BoshClient, BoshClientConfig, BoshClientFactory, BoshConnectionListener, BoshError,
    BoshMessageEvent, BoshRequestListener, BoshResponseListener, ConnectionEvent,
};

/// What the scripted connection manager does in response to a sent body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Connected,
    Disconnected,
    Error(BoshError),
    Body(String),
}

type Script = dyn Fn(&ComposableBody) -> Vec<Reply> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Delivery {
    Event(ConnectionEvent),
    Response(String),
    Request(String),
    Barrier(mpsc::Sender<()>),
}

#[derive(Default)]
struct Listeners {
    connection: Mutex<Vec<Arc<dyn BoshConnectionListener>>>,
    response: Mutex<Vec<Arc<dyn BoshResponseListener>>>,
    request: Mutex<Vec<Arc<dyn BoshRequestListener>>>,
}

impl Listeners {
    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Event(event) => {
                let listeners = lock(&self.connection).clone();
                for listener in listeners {
                    listener.connection_event(event.clone());
                }
            }
            Delivery::Response(body) => {
                let listeners = lock(&self.response).clone();
                for listener in listeners {
                    listener.response_received(BoshMessageEvent::new(body.clone()));
                }
            }
            Delivery::Request(body) => {
                let listeners = lock(&self.request).clone();
                for listener in listeners {
                    listener.request_sent(BoshMessageEvent::new(body.clone()));
                }
            }
            Delivery::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

struct ClientState {
    config: BoshClientConfig,
    listeners: Arc<Listeners>,
    worker: Mutex<mpsc::Sender<Delivery>>,
    sent: Mutex<Vec<ComposableBody>>,
    closed: Mutex<bool>,
    disconnected: Mutex<bool>,
}

impl ClientState {
    fn spawn(config: BoshClientConfig) -> Arc<Self> {
        let listeners = Arc::new(Listeners::default());
        let (sender, receiver) = mpsc::channel::<Delivery>();
        let worker_listeners = Arc::clone(&listeners);
        thread::Builder::new()
            .name("fake-bosh-worker".to_string())
            .spawn(move || {
                for delivery in receiver {
                    worker_listeners.deliver(delivery);
                }
            })
            .unwrap_or_else(|error| panic!("failed to spawn fake BOSH worker: {error}"));

        Arc::new(Self {
            config,
            listeners,
            worker: Mutex::new(sender),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            disconnected: Mutex::new(false),
        })
    }

    fn queue(&self, delivery: Delivery) {
        // The worker only stops once every sender is gone.
        let _ = lock(&self.worker).send(delivery);
    }

    fn queue_reply(&self, reply: Reply) {
        self.queue(match reply {
            Reply::Connected => Delivery::Event(ConnectionEvent::Connected),
            Reply::Disconnected => Delivery::Event(ConnectionEvent::Disconnected),
            Reply::Error(error) => Delivery::Event(ConnectionEvent::Error(error)),
            Reply::Body(body) => Delivery::Response(body),
        });
    }

    /// Blocks until everything queued so far has been delivered.
    fn settle(&self) {
        let (ack, done) = mpsc::channel();
        self.queue(Delivery::Barrier(ack));
        let _ = done.recv_timeout(Duration::from_secs(5));
    }
}

#[derive(Default)]
struct Shared {
    script: Mutex<Option<Arc<Script>>>,
    clients: Mutex<Vec<Arc<ClientState>>>,
    create_error: Mutex<Option<BoshError>>,
    send_error: Mutex<Option<BoshError>>,
}

/// Scripted connection manager and client factory.
#[derive(Clone, Default)]
pub struct FakeBosh {
    shared: Arc<Shared>,
}

impl FakeBosh {
    /// A connection manager that never answers.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn scripted<S>(script: S) -> Self
    where
        S: Fn(&ComposableBody) -> Vec<Reply> + Send + Sync + 'static,
    {
        let fake = Self::default();
        fake.set_script(script);
        fake
    }

    /// Accepts session creation with `sid` and stays quiet afterwards.
    pub fn accepting(sid: &'static str) -> Self {
        Self::scripted(move |body| {
            if is_session_creation(body) {
                vec![
                    Reply::Body(crate::bodies::session_created(sid, "stream-1")),
                    Reply::Connected,
                ]
            } else {
                Vec::new()
            }
        })
    }

    pub fn set_script<S>(&self, script: S)
    where
        S: Fn(&ComposableBody) -> Vec<Reply> + Send + Sync + 'static,
    {
        *lock(&self.shared.script) = Some(Arc::new(script));
    }

    pub fn fail_create(&self, error: BoshError) {
        *lock(&self.shared.create_error) = Some(error);
    }

    pub fn fail_sends(&self, error: Option<BoshError>) {
        *lock(&self.shared.send_error) = error;
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    pub fn last_config(&self) -> Option<BoshClientConfig> {
        self.latest().map(|client| client.config.clone())
    }

    /// Bodies sent through the most recent client.
    pub fn sent(&self) -> Vec<ComposableBody> {
        self.latest()
            .map(|client| lock(&client.sent).clone())
            .unwrap_or_default()
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|body| body.payload_xml().to_string())
            .collect()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        lock(&self.shared.clients)
            .get(index)
            .is_some_and(|client| *lock(&client.closed))
    }

    pub fn is_disconnected(&self, index: usize) -> bool {
        lock(&self.shared.clients)
            .get(index)
            .is_some_and(|client| *lock(&client.disconnected))
    }

    /// Queues a connection event on the most recent client.
    pub fn fire(&self, event: ConnectionEvent) {
        if let Some(client) = self.latest() {
            client.queue(Delivery::Event(event));
        }
    }

    /// Queues a response body on the most recent client.
    pub fn deliver(&self, body: impl Into<String>) {
        if let Some(client) = self.latest() {
            client.queue(Delivery::Response(body.into()));
        }
    }

    /// Queues a connection event on the client created `index`th.
    pub fn fire_on(&self, index: usize, event: ConnectionEvent) {
        if let Some(client) = self.client(index) {
            client.queue(Delivery::Event(event));
        }
    }

    /// Queues a response body on the client created `index`th.
    pub fn deliver_on(&self, index: usize, body: impl Into<String>) {
        if let Some(client) = self.client(index) {
            client.queue(Delivery::Response(body.into()));
        }
    }

    /// Blocks until every delivery queued on any client has reached the listeners.
    pub fn settle(&self) {
        let clients = lock(&self.shared.clients).clone();
        for client in clients {
            client.settle();
        }
    }

    /// Polls until a body matching `predicate` was sent, or `timeout` elapses.
    pub async fn wait_for_sent<P>(&self, timeout: Duration, predicate: P) -> Option<ComposableBody>
    where
        P: Fn(&ComposableBody) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(body) = self.sent().into_iter().find(|body| predicate(body)) {
                return Some(body);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn client(&self, index: usize) -> Option<Arc<ClientState>> {
        lock(&self.shared.clients).get(index).cloned()
    }

    fn latest(&self) -> Option<Arc<ClientState>> {
        lock(&self.shared.clients).last().cloned()
    }
}

impl BoshClientFactory for FakeBosh {
    type Client = FakeBoshClient;

    fn create(&self, config: BoshClientConfig) -> Result<Self::Client, BoshError> {
        if let Some(error) = lock(&self.shared.create_error).clone() {
            return Err(error);
        }
        let state = ClientState::spawn(config);
        lock(&self.shared.clients).push(Arc::clone(&state));
        Ok(FakeBoshClient {
            state,
            shared: Arc::clone(&self.shared),
        })
    }
}

pub struct FakeBoshClient {
    state: Arc<ClientState>,
    shared: Arc<Shared>,
}

impl BoshClient for FakeBoshClient {
    fn send(&self, body: ComposableBody) -> Result<(), BoshError> {
        if *lock(&self.state.closed) {
            return Err(BoshError::Closed);
        }
        if let Some(error) = lock(&self.shared.send_error).clone() {
            return Err(error);
        }

        trace!(body = %body.to_xml(), "fake BOSH client sent body");
        lock(&self.state.sent).push(body.clone());
        self.state.queue(Delivery::Request(body.to_xml()));

        let script = lock(&self.shared.script).clone();
        if let Some(script) = script {
            for reply in script(&body) {
                self.state.queue_reply(reply);
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BoshError> {
        *lock(&self.state.disconnected) = true;
        self.state
            .queue(Delivery::Event(ConnectionEvent::Disconnected));
        Ok(())
    }

    fn close(&self) {
        *lock(&self.state.closed) = true;
    }

    fn add_connection_listener(&self, listener: Arc<dyn BoshConnectionListener>) {
        lock(&self.state.listeners.connection).push(listener);
    }

    fn add_response_listener(&self, listener: Arc<dyn BoshResponseListener>) {
        lock(&self.state.listeners.response).push(listener);
    }

    fn add_request_listener(&self, listener: Arc<dyn BoshRequestListener>) {
        lock(&self.state.listeners.request).push(listener);
    }
}

/// The body that opens a session: it declares the protocol version and has no sid yet.
pub fn is_session_creation(body: &ComposableBody) -> bool {
    body.attribute(&VERSION).is_some() && body.attribute(&SID).is_none()
}

pub fn is_restart(body: &ComposableBody) -> bool {
    body.attribute(&waddle_bosh::body::RESTART) == Some("true")
}

pub fn payload_contains(body: &ComposableBody, needle: &str) -> bool {
    body.payload_xml().contains(needle)
}
