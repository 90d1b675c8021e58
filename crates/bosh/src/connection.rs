//! XMPP session over a BOSH long-poll transport.
//!
//! [`BoshConnection`] owns one transport client at a time. The client reports
//! connection changes and response bodies from its own threads through the
//! listener traits in [`crate::transport`]; async callers rendezvous with
//! those callbacks through [`Notify`] handles guarded by a deadline.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use tokio::{
    runtime::Handle,
    sync::{Notify, broadcast, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use xmpp_parsers::{jid::FullJid, minidom::Element};

use crate::{
    body::{
        ComposableBody, RESTART, SID, TO, VERSION, XMPP_BOSH_NS, XMPP_BOSH_PREFIX,
        escape_attribute,
    },
    config::BoshConfiguration,
    error::{BoshError, ConnectionError, SaslError},
    event::{EVENT_CHANNEL_CAPACITY, SessionEvent},
    pipeline::{StanzaPipeline, StanzaProcessor},
    reader::{self, BIND_NS, BodyHandler, JABBER_CLIENT, SASL_NS, StanzaErrorInfo, StreamFeatures},
    sasl::{
        AttemptContext, NonzaSink, SaslAttempt, SaslAttemptError, SaslMechanism,
        SaslMechanismRegistry,
    },
    stanza::Stanza,
    transport::{
        BoshClient, BoshClientConfig, BoshClientFactory, BoshConnectionListener,
        BoshMessageEvent, BoshRequestListener, BoshResponseListener, ConnectionEvent,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// Credentials of the last successful login, replayed on automatic relogin.
#[derive(Clone)]
struct LoginCredentials {
    username: String,
    password: String,
    resource: Option<String>,
}

impl LoginCredentials {
    fn from_config(config: &BoshConfiguration) -> Self {
        Self {
            username: config.account.username.clone(),
            password: config.account.password.clone(),
            resource: config.account.resource.clone(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    session_id: Option<String>,
    stream_id: Option<String>,
    connected: bool,
    authenticated: bool,
    /// Sticky across disconnects; decides whether a reconnect logs in again.
    was_authenticated: bool,
    /// Set by shutdown. Cleared only by the next `connect`.
    done: bool,
    /// True until the first `Connected` event has been seen.
    first_initialization: bool,
    /// A connection event arrived since the last `connect` started.
    notified: bool,
    /// Bumped whenever the installed client changes or the session ends.
    /// Listener callbacks carrying another value come from a retired client.
    generation: u64,
    event_error: Option<BoshError>,
    features: Option<StreamFeatures>,
    user: Option<FullJid>,
    credentials: Option<LoginCredentials>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            session_id: None,
            stream_id: None,
            connected: false,
            authenticated: false,
            was_authenticated: false,
            done: false,
            first_initialization: true,
            notified: false,
            generation: 0,
            event_error: None,
            features: None,
            user: None,
            credentials: None,
        }
    }
}

enum Wait<T> {
    Ready(T),
    TimedOut,
    Interrupted,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<F: BoshClientFactory> {
    config: BoshConfiguration,
    factory: F,
    client: Mutex<Option<Arc<F::Client>>>,
    session: Mutex<Session>,
    connect_notify: Notify,
    features_notify: Notify,
    sasl_notify: Notify,
    // Lock order: `sasl` before `session`.
    sasl: Mutex<Option<SaslAttempt>>,
    registry: Mutex<SaslMechanismRegistry>,
    login_lock: tokio::sync::Mutex<()>,
    pipeline: RwLock<StanzaPipeline>,
    pending_iqs: Mutex<HashMap<String, oneshot::Sender<Element>>>,
    events: broadcast::Sender<SessionEvent>,
    interrupt: Mutex<CancellationToken>,
    runtime: Mutex<Option<Handle>>,
}

/// An XMPP session carried over BOSH.
///
/// Cheap to clone; clones share the same session.
pub struct BoshConnection<F: BoshClientFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: BoshClientFactory> Clone for BoshConnection<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: BoshClientFactory> BoshConnection<F> {
    pub fn new(config: BoshConfiguration, factory: F) -> Self {
        Self::with_registry(config, factory, SaslMechanismRegistry::default())
    }

    pub fn with_registry(
        config: BoshConfiguration,
        factory: F,
        registry: SaslMechanismRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                client: Mutex::new(None),
                session: Mutex::new(Session::default()),
                connect_notify: Notify::new(),
                features_notify: Notify::new(),
                sasl_notify: Notify::new(),
                sasl: Mutex::new(None),
                registry: Mutex::new(registry),
                login_lock: tokio::sync::Mutex::new(()),
                pipeline: RwLock::new(StanzaPipeline::new()),
                pending_iqs: Mutex::new(HashMap::new()),
                events,
                interrupt: Mutex::new(CancellationToken::new()),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BoshConfiguration {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_processor(&self, processor: Box<dyn StanzaProcessor>) {
        self.inner
            .pipeline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(processor);
    }

    pub fn register_mechanism(&self, template: Box<dyn SaslMechanism>) {
        lock(&self.inner.registry).register(template);
    }

    pub fn blacklist_mechanism(&self, name: &str) {
        lock(&self.inner.registry).blacklist(name);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session().authenticated
    }

    pub fn was_authenticated(&self) -> bool {
        self.inner.session().was_authenticated
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session().session_id.clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.inner.session().stream_id.clone()
    }

    /// The bound JID of the current login, if any.
    pub fn user(&self) -> Option<FullJid> {
        self.inner.session().user.clone()
    }

    /// Opens a new BOSH session and waits for the transport to report on it.
    ///
    /// Any previous client is closed first. The wait is bounded by the
    /// configured reply timeout; a timeout marks the connection done.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let generation = {
            let mut session = inner.session();
            session.generation += 1;
            session.done = false;
            session.connected = false;
            session.was_authenticated |= session.authenticated;
            session.authenticated = false;
            session.notified = false;
            session.event_error = None;
            session.session_id = None;
            session.stream_id = None;
            session.features = None;
            session.state = ConnectionState::Connecting;
            session.generation
        };
        *lock(&inner.runtime) = Handle::try_current().ok();
        let interrupt = inner.interrupt_token();

        let previous = lock(&inner.client).take();
        if let Some(previous) = previous {
            debug!("closing previous BOSH client");
            previous.close();
        }

        info!(
            host = inner.config.host(),
            port = inner.config.port(),
            domain = inner.config.xmpp_service_domain(),
            "opening BOSH session"
        );
        if let Err(error) = inner.open_client(generation) {
            inner.session().state = ConnectionState::Disconnected;
            return Err(ConnectionError::Setup(error));
        }

        let deadline = Instant::now() + inner.config.reply_timeout();
        let waited = inner
            .wait_until(&inner.connect_notify, deadline, &interrupt, |inner| {
                let session = inner.session();
                (session.connected || session.notified).then_some(())
            })
            .await;

        let mut session = inner.session();
        if let Wait::Interrupted = waited {
            session.state = ConnectionState::Disconnected;
            return Err(ConnectionError::Interrupted {
                waiting_for: "BOSH session creation".to_string(),
            });
        }
        if session.connected {
            return Ok(());
        }
        if let Some(cause) = session.event_error.take() {
            session.state = ConnectionState::Disconnected;
            return Err(ConnectionError::Transport(cause));
        }
        if !session.done {
            session.done = true;
            session.state = ConnectionState::Closed;
            warn!(
                host = inner.config.host(),
                port = inner.config.port(),
                "BOSH session creation timed out"
            );
            return Err(ConnectionError::SessionTimeout {
                host: inner.config.host().to_string(),
                port: inner.config.port(),
            });
        }
        Err(ConnectionError::NotConnected)
    }

    /// Sends a raw body, stamped with the session id once one is known.
    ///
    /// Transport failures are logged and swallowed; the transport reports
    /// them again through its connection listener.
    pub fn send(&self, body: ComposableBody) -> Result<(), ConnectionError> {
        self.inner.send(body)
    }

    pub fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        if self.inner.session().done {
            return Err(ConnectionError::NotConnected);
        }
        let processed = self
            .inner
            .pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .process_outbound(stanza)?;
        let Some(bytes) = processed else {
            return Ok(());
        };
        self.inner
            .send_element_xml(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn send_nonza(&self, nonza: &Element) -> Result<(), ConnectionError> {
        let mut bytes = Vec::new();
        nonza
            .write_to(&mut bytes)
            .map_err(|error| ConnectionError::Parse(format!("failed to serialize nonza: {error}")))?;
        self.inner
            .send_element_xml(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Asks the connection manager to restart the stream after SASL success.
    pub fn after_sasl_authentication_success(&self) -> Result<(), ConnectionError> {
        self.inner.after_sasl_authentication_success()
    }

    /// Authenticates with SASL and binds a resource when the server offers it.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<(), ConnectionError> {
        self.login_with(LoginCredentials {
            username: username.to_string(),
            password: password.to_string(),
            resource: resource.map(str::to_string),
        })
        .await
    }

    /// Logs in with the credentials of the previous login, falling back to
    /// the configured account.
    pub async fn login_with_stored(&self) -> Result<(), ConnectionError> {
        let stored = self.inner.session().credentials.clone();
        let credentials = stored.unwrap_or_else(|| LoginCredentials::from_config(&self.inner.config));
        self.login_with(credentials).await
    }

    async fn login_with(&self, credentials: LoginCredentials) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let _login = inner.login_lock.lock().await;
        let interrupt = inner.interrupt_token();
        {
            let session = inner.session();
            if session.done || !session.connected {
                return Err(ConnectionError::NotConnected);
            }
            if session.authenticated {
                return Err(ConnectionError::AlreadyLoggedIn);
            }
        }

        let features = inner
            .wait_for_features("SASL mechanisms", &interrupt, |features| {
                !features.mechanisms.is_empty()
            })
            .await?;

        let authorization_id = inner
            .config
            .authzid()
            .map_err(|error| ConnectionError::InvalidArgument(error.to_string()))?;
        let attempt = lock(&inner.registry).select(&features.mechanisms, authorization_id.is_some())?;
        let mechanism = attempt.mechanism_name();
        debug!(mechanism, offered = ?features.mechanisms, "selected SASL mechanism");

        let context = AttemptContext {
            authentication_id: credentials.username.clone(),
            authorization_id,
            password: credentials.password.clone(),
            service_name: inner.config.xmpp_service_domain().to_string(),
            host: inner.config.host().to_string(),
            channel: None,
        };
        {
            let mut current = lock(&inner.sasl);
            let attempt = current.insert(attempt);
            if let Err(error) = attempt.authenticate(&**inner, context) {
                attempt.set_exception(error);
            }
        }

        let timeout = inner.config.reply_timeout();
        let waited = inner
            .wait_until(&inner.sasl_notify, Instant::now() + timeout, &interrupt, |inner| {
                let finished = lock(&inner.sasl)
                    .as_ref()
                    .is_none_or(SaslAttempt::is_finished);
                (finished || !inner.session().connected).then_some(())
            })
            .await;
        let attempt = {
            let mut current = lock(&inner.sasl);
            if let (Wait::Interrupted, Some(attempt)) = (&waited, current.as_mut()) {
                attempt.set_exception(SaslAttemptError::Interrupted);
            }
            current.take()
        };
        let Some(attempt) = attempt else {
            return Err(ConnectionError::NotConnected);
        };
        if !attempt.is_finished() && !inner.session().connected {
            return Err(ConnectionError::NotConnected);
        }
        attempt.throw_exception_if_required(timeout)?;
        info!(mechanism, "SASL authentication successful");

        inner.session().features = None;
        inner.after_sasl_authentication_success()?;

        let features = inner
            .wait_for_features("stream features after restart", &interrupt, |_| true)
            .await?;
        let user = if features.bind {
            Some(
                self.bind_resource(credentials.resource.as_deref(), &interrupt)
                    .await?,
            )
        } else {
            None
        };

        {
            let mut session = inner.session();
            session.authenticated = true;
            session.user = user.clone();
            session.credentials = Some(credentials);
        }
        info!(jid = ?user, "logged in");
        inner.publish(SessionEvent::Authenticated { jid: user });
        Ok(())
    }

    async fn bind_resource(
        &self,
        resource: Option<&str>,
        interrupt: &CancellationToken,
    ) -> Result<FullJid, ConnectionError> {
        let inner = &self.inner;
        let id = format!("bind-{}", Uuid::new_v4());
        let (sender, receiver) = oneshot::channel();
        lock(&inner.pending_iqs).insert(id.clone(), sender);

        let resource = resource
            .map(|resource| format!("<resource>{}</resource>", escape_attribute(resource)))
            .unwrap_or_default();
        let xml = format!(
            "<iq xmlns='{JABBER_CLIENT}' type='set' id='{id}'><bind xmlns='{BIND_NS}'>{resource}</bind></iq>"
        );
        if let Err(error) = inner.send_element_xml(xml) {
            lock(&inner.pending_iqs).remove(&id);
            return Err(error);
        }

        let timeout = inner.config.reply_timeout();
        let response = tokio::select! {
            response = tokio::time::timeout(timeout, receiver) => response,
            _ = interrupt.cancelled() => {
                lock(&inner.pending_iqs).remove(&id);
                return Err(ConnectionError::Interrupted {
                    waiting_for: "resource binding".to_string(),
                });
            }
        };
        match response {
            Ok(Ok(iq)) => parse_bind_response(&iq),
            // The sender is dropped by shutdown.
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => {
                lock(&inner.pending_iqs).remove(&id);
                Err(ConnectionError::no_response("resource binding", timeout))
            }
        }
    }

    /// Sends unavailable presence when possible, then shuts down.
    pub fn disconnect(&self) {
        if self.is_connected() {
            let presence = format!("<presence xmlns='{JABBER_CLIENT}' type='unavailable'/>");
            if let Err(error) = self.inner.send_element_xml(presence) {
                debug!(%error, "failed to send unavailable presence");
            }
        }
        self.shutdown();
        self.inner.publish(SessionEvent::ConnectionClosed);
    }

    /// Disconnects the transport client, then shuts down the session.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Marks the session done without touching the transport.
    pub fn instant_shutdown(&self) {
        self.inner.instant_shutdown();
    }

    /// Wakes every in-flight wait with an interruption error.
    pub fn interrupt(&self) {
        lock(&self.inner.interrupt).cancel();
    }
}

impl<F: BoshClientFactory> Inner<F> {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn publish_connection_error(&self, error: ConnectionError) {
        warn!(%error, "connection error");
        self.publish(SessionEvent::ConnectionError(error));
    }

    fn publish(&self, event: SessionEvent) {
        trace!(event = event.name(), "publishing session event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// The current interrupt token, replaced once it has been used.
    fn interrupt_token(&self) -> CancellationToken {
        let mut token = lock(&self.interrupt);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    async fn wait_until<T>(
        &self,
        notify: &Notify,
        deadline: Instant,
        interrupt: &CancellationToken,
        mut ready: impl FnMut(&Self) -> Option<T>,
    ) -> Wait<T> {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = ready(self) {
                return Wait::Ready(value);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return match ready(self) {
                        Some(value) => Wait::Ready(value),
                        None => Wait::TimedOut,
                    };
                }
                _ = interrupt.cancelled() => return Wait::Interrupted,
            }
        }
    }

    async fn wait_for_features(
        &self,
        waiting_for: &str,
        interrupt: &CancellationToken,
        accept: fn(&StreamFeatures) -> bool,
    ) -> Result<StreamFeatures, ConnectionError> {
        let timeout = self.config.reply_timeout();
        let waited = self
            .wait_until(&self.features_notify, Instant::now() + timeout, interrupt, |inner| {
                let session = inner.session();
                if !session.connected {
                    return Some(Err(ConnectionError::NotConnected));
                }
                session
                    .features
                    .as_ref()
                    .filter(|features| accept(features))
                    .cloned()
                    .map(Ok)
            })
            .await;
        match waited {
            Wait::Ready(result) => result,
            Wait::TimedOut => Err(ConnectionError::no_response(waiting_for, timeout)),
            Wait::Interrupted => Err(ConnectionError::Interrupted {
                waiting_for: waiting_for.to_string(),
            }),
        }
    }

    /// Creates the transport client, wires its listeners and sends the
    /// session creation request.
    fn open_client(self: &Arc<Self>, generation: u64) -> Result<(), BoshError> {
        let uri = self
            .config
            .uri()
            .map_err(|error| BoshError::InvalidConfig(error.to_string()))?;
        let mut client_config = BoshClientConfig::new(uri.as_str(), self.config.xmpp_service_domain())
            .with_compression(self.config.http.compression);
        if let Some(proxy) = &self.config.proxy {
            client_config = client_config.with_proxy(&proxy.host, proxy.port);
        }
        for (name, value) in &self.config.http.headers {
            client_config = client_config.with_header(name, value);
        }

        let client = Arc::new(self.factory.create(client_config)?);
        let listener = Arc::new(SessionListener {
            inner: Arc::downgrade(self),
            generation,
        });
        client.add_connection_listener(listener.clone());
        client.add_response_listener(listener);
        if self.config.session.debug {
            client.add_request_listener(Arc::new(TrafficLogger));
            client.add_response_listener(Arc::new(TrafficLogger));
        }
        *lock(&self.client) = Some(Arc::clone(&client));

        client.send(
            ComposableBody::builder()
                .namespace_definition(XMPP_BOSH_PREFIX, XMPP_BOSH_NS)
                .attribute(VERSION, "1.0")
                .build(),
        )
    }

    fn transmit(&self, body: ComposableBody) -> Result<(), ConnectionError> {
        let body = {
            let session = self.session();
            if session.done {
                return Err(ConnectionError::NotConnected);
            }
            if !session.connected {
                return Err(ConnectionError::IllegalState);
            }
            match &session.session_id {
                Some(sid) => body.rebuild().attribute(SID, sid.clone()).build(),
                None => body,
            }
        };
        let client = lock(&self.client)
            .clone()
            .ok_or(ConnectionError::IllegalState)?;
        client.send(body).map_err(ConnectionError::Transport)
    }

    fn send(&self, body: ComposableBody) -> Result<(), ConnectionError> {
        match self.transmit(body) {
            Err(ConnectionError::Transport(error)) => {
                error!(%error, "failed to send BOSH body");
                Ok(())
            }
            other => other,
        }
    }

    fn send_element_xml(&self, xml: String) -> Result<(), ConnectionError> {
        if self.session().done {
            return Err(ConnectionError::NotConnected);
        }
        self.send(ComposableBody::with_payload(xml))
    }

    fn after_sasl_authentication_success(&self) -> Result<(), ConnectionError> {
        let body = ComposableBody::builder()
            .namespace_definition(XMPP_BOSH_PREFIX, XMPP_BOSH_NS)
            .attribute(RESTART, "true")
            .attribute(TO, self.config.xmpp_service_domain())
            .build();
        match self.transmit(body) {
            Err(ConnectionError::Transport(error)) => {
                Err(ConnectionError::AuthenticationRestart(error))
            }
            other => other,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session().generation == generation
    }

    fn handle_connection_event(self: &Arc<Self>, generation: u64, event: ConnectionEvent) {
        if event.is_connected() {
            let relogin = {
                let mut session = self.session();
                if session.generation != generation {
                    debug!(generation, "ignoring event from a retired BOSH client");
                    return;
                }
                session.notified = true;
                session.connected = true;
                session.state = ConnectionState::Connected;
                if session.first_initialization {
                    session.first_initialization = false;
                    false
                } else {
                    session.was_authenticated
                }
            };
            let _wake = WakeGuard { inner: &**self };
            info!(sid = ?self.session().session_id, "BOSH session established");
            self.publish(SessionEvent::Connected);
            if relogin {
                self.spawn_relogin();
            }
            return;
        }

        let cause = event.cause().cloned();
        {
            let mut session = self.session();
            if session.generation != generation {
                debug!(generation, "ignoring event from a retired BOSH client");
                return;
            }
            session.notified = true;
            session.connected = false;
            session.was_authenticated |= session.authenticated;
            session.authenticated = false;
            session.features = None;
            session.event_error = cause.clone();
            if session.state != ConnectionState::Closed {
                session.state = ConnectionState::Disconnected;
            }
        }
        let _wake = WakeGuard { inner: &**self };
        match cause {
            Some(cause) => self.publish_connection_error(ConnectionError::Transport(cause)),
            None => info!("BOSH session disconnected"),
        }
    }

    fn spawn_relogin(self: &Arc<Self>) {
        let Some(runtime) = lock(&self.runtime).clone() else {
            error!("no async runtime available for automatic relogin");
            return;
        };
        info!("reconnected after authentication, logging in again");
        let connection = BoshConnection {
            inner: Arc::clone(self),
        };
        runtime.spawn(async move {
            if let Err(error) = connection.login_with_stored().await {
                error!(%error, "automatic relogin failed");
                connection.inner.notify_connection_error(error);
            }
        });
    }

    fn shutdown(&self) {
        let client = lock(&self.client).take();
        if let Some(client) = client
            && let Err(error) = client.disconnect()
        {
            warn!(%error, "failed to disconnect BOSH client");
        }
        self.instant_shutdown();
    }

    fn instant_shutdown(&self) {
        {
            let mut session = self.session();
            session.generation += 1;
            session.was_authenticated |= session.authenticated;
            session.session_id = None;
            session.stream_id = None;
            session.authenticated = false;
            session.connected = false;
            session.done = true;
            session.first_initialization = false;
            session.features = None;
            session.state = ConnectionState::Closed;
        }
        lock(&self.pending_iqs).clear();
        self.connect_notify.notify_waiters();
        self.features_notify.notify_waiters();
        self.sasl_notify.notify_waiters();
        debug!("session shut down");
    }

    fn process_sasl(&self, element: &Element) {
        {
            let mut current = lock(&self.sasl);
            let Some(attempt) = current.as_mut() else {
                warn!(element = element.name(), "SASL element without an active attempt");
                return;
            };
            let outcome = match element.name() {
                "challenge" => attempt.challenge_received(self, &element.text(), false),
                "success" => {
                    let data = element.text();
                    let evaluated = if data.trim().is_empty() {
                        Ok(())
                    } else {
                        attempt.challenge_received(self, &data, true)
                    };
                    evaluated.and_then(|()| attempt.after_final_sasl_challenge())
                }
                _ => Err(SaslAttemptError::Failure(sasl_failure(
                    attempt.mechanism_name(),
                    element,
                ))),
            };
            if let Err(error) = outcome {
                debug!(?error, "SASL attempt failed");
                attempt.set_exception(error);
            }
        }
        self.sasl_notify.notify_waiters();
    }
}

impl<F: BoshClientFactory> BodyHandler for Inner<F> {
    fn latch_session_ids(&self, sid: Option<&str>, authid: Option<&str>) {
        latch_ids(&mut self.session(), sid, authid);
    }

    fn is_connected(&self) -> bool {
        self.session().connected
    }

    fn process_stanza(&self, element: Element) -> Result<(), ConnectionError> {
        if element.name() == "iq"
            && matches!(element.attr("type"), Some("result" | "error"))
            && let Some(id) = element.attr("id")
        {
            let waiter = lock(&self.pending_iqs).remove(id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(element);
                return Ok(());
            }
        }

        let stanza = Stanza::try_from(element)?;
        let processed = self
            .pipeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .process_inbound(stanza);
        if let Some(stanza) = processed {
            self.publish(SessionEvent::Stanza(stanza));
        }
        Ok(())
    }

    fn process_features(&self, features: StreamFeatures) -> Result<(), ConnectionError> {
        debug!(
            mechanisms = ?features.mechanisms,
            bind = features.bind,
            "stream features received"
        );
        self.session().features = Some(features.clone());
        self.features_notify.notify_waiters();
        self.publish(SessionEvent::Features(features));
        Ok(())
    }

    fn process_nonza(&self, element: Element) -> Result<(), ConnectionError> {
        if element.has_ns(SASL_NS) && matches!(element.name(), "challenge" | "success" | "failure")
        {
            self.process_sasl(&element);
            return Ok(());
        }
        trace!(element = element.name(), "nonza received");
        self.publish(SessionEvent::Nonza(element));
        Ok(())
    }

    fn notify_connection_error(&self, error: ConnectionError) {
        let terminal = error.is_terminal();
        self.publish_connection_error(error);
        if terminal {
            self.instant_shutdown();
        }
    }
}

/// First write wins for both identifiers.
fn latch_ids(session: &mut Session, sid: Option<&str>, authid: Option<&str>) {
    if session.session_id.is_none()
        && let Some(sid) = sid
    {
        session.session_id = Some(sid.to_string());
    }
    if session.stream_id.is_none()
        && let Some(authid) = authid
    {
        session.stream_id = Some(authid.to_string());
    }
}

impl<F: BoshClientFactory> NonzaSink for Inner<F> {
    fn send_nonza_xml(&self, xml: String) -> Result<(), ConnectionError> {
        self.send_element_xml(xml)
    }
}

/// Wakes every waiter whatever branch the event handler takes.
struct WakeGuard<'a, F: BoshClientFactory> {
    inner: &'a Inner<F>,
}

impl<F: BoshClientFactory> Drop for WakeGuard<'_, F> {
    fn drop(&mut self) {
        self.inner.connect_notify.notify_waiters();
        self.inner.features_notify.notify_waiters();
        self.inner.sasl_notify.notify_waiters();
    }
}

struct SessionListener<F: BoshClientFactory> {
    inner: Weak<Inner<F>>,
    generation: u64,
}

impl<F: BoshClientFactory> BoshConnectionListener for SessionListener<F> {
    fn connection_event(&self, event: ConnectionEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_connection_event(self.generation, event);
        }
    }
}

impl<F: BoshClientFactory> BoshResponseListener for SessionListener<F> {
    fn response_received(&self, event: BoshMessageEvent) {
        let (Some(inner), Some(body)) = (self.inner.upgrade(), event.body) else {
            return;
        };
        let handler = ClientBodies {
            inner: &*inner,
            generation: self.generation,
        };
        reader::read_body(&handler, &body);
    }
}

/// Body handler bound to one client; bodies from a retired client are dropped.
struct ClientBodies<'a, F: BoshClientFactory> {
    inner: &'a Inner<F>,
    generation: u64,
}

impl<F: BoshClientFactory> BodyHandler for ClientBodies<'_, F> {
    fn latch_session_ids(&self, sid: Option<&str>, authid: Option<&str>) {
        let mut session = self.inner.session();
        if session.generation == self.generation {
            latch_ids(&mut session, sid, authid);
        }
    }

    fn is_connected(&self) -> bool {
        let session = self.inner.session();
        session.generation == self.generation && session.connected
    }

    fn process_stanza(&self, element: Element) -> Result<(), ConnectionError> {
        if !self.inner.is_current(self.generation) {
            return Ok(());
        }
        self.inner.process_stanza(element)
    }

    fn process_features(&self, features: StreamFeatures) -> Result<(), ConnectionError> {
        if !self.inner.is_current(self.generation) {
            return Ok(());
        }
        self.inner.process_features(features)
    }

    fn process_nonza(&self, element: Element) -> Result<(), ConnectionError> {
        if !self.inner.is_current(self.generation) {
            return Ok(());
        }
        self.inner.process_nonza(element)
    }

    fn notify_connection_error(&self, error: ConnectionError) {
        if self.inner.is_current(self.generation) {
            self.inner.notify_connection_error(error);
        }
    }
}

struct TrafficLogger;

impl BoshRequestListener for TrafficLogger {
    fn request_sent(&self, event: BoshMessageEvent) {
        if let Some(body) = event.body {
            trace!(target: "waddle_bosh::traffic", %body, "SENT");
        }
    }
}

impl BoshResponseListener for TrafficLogger {
    fn response_received(&self, event: BoshMessageEvent) {
        if let Some(body) = event.body {
            trace!(target: "waddle_bosh::traffic", %body, "RECV");
        }
    }
}

fn sasl_failure(mechanism: &str, failure: &Element) -> SaslError {
    let condition = failure
        .children()
        .find(|child| child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "not-authorized".to_string());
    let text = failure
        .get_child("text", SASL_NS)
        .map(Element::text)
        .filter(|text| !text.is_empty());
    SaslError::Failure {
        mechanism: mechanism.to_string(),
        condition,
        text,
    }
}

fn parse_bind_response(iq: &Element) -> Result<FullJid, ConnectionError> {
    if iq.attr("type") != Some("result") {
        let error = iq
            .children()
            .find(|child| child.name() == "error")
            .map(StanzaErrorInfo::from_element)
            .unwrap_or(StanzaErrorInfo {
                error_type: None,
                condition: "undefined-condition".to_string(),
                text: None,
            });
        return Err(ConnectionError::Xmpp(error));
    }

    let jid = iq
        .get_child("bind", BIND_NS)
        .and_then(|bind| bind.get_child("jid", BIND_NS))
        .map(Element::text)
        .ok_or_else(|| ConnectionError::Parse("bind result without a jid".to_string()))?;
    jid.trim()
        .parse::<FullJid>()
        .map_err(|error| ConnectionError::Parse(format!("invalid bound JID '{jid}': {error}")))
}
