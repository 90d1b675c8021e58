#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::broadcast::{Receiver, error::RecvError};
use waddle_bosh::{BoshConfiguration, BoshConnection, SessionEvent};
use waddle_test_support::bodies;
use waddle_test_support::bosh::{FakeBosh, Reply, is_restart, is_session_creation, payload_contains};

pub const SID: &str = "sid-1";
pub const BOUND_JID: &str = "alice@example.com/laptop";
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn config(reply_timeout: Duration) -> BoshConfiguration {
    BoshConfiguration::builder()
        .host("bosh.example.com")
        .xmpp_domain("example.com")
        .username_and_password("alice", "secret")
        .reply_timeout(reply_timeout)
        .build()
        .expect("test configuration should be valid")
}

pub fn connection(fake: &FakeBosh, reply_timeout: Duration) -> BoshConnection<FakeBosh> {
    BoshConnection::new(config(reply_timeout), fake.clone())
}

/// A connected session whose pending deliveries have all been processed.
pub async fn connected(fake: &FakeBosh, reply_timeout: Duration) -> BoshConnection<FakeBosh> {
    let connection = connection(fake, reply_timeout);
    connection.connect().await.expect("connect");
    fake.settle();
    connection
}

/// How the scripted server answers `<auth/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure,
    Silent,
}

/// A connection manager that walks through SASL, stream restart and
/// resource binding.
pub fn login_server(mechanisms: &'static [&'static str], outcome: AuthOutcome, bind: bool) -> FakeBosh {
    FakeBosh::scripted(move |body| {
        if is_session_creation(body) {
            return vec![
                Reply::Body(bodies::session_created(SID, "stream-1")),
                Reply::Connected,
                Reply::Body(bodies::features_with_mechanisms(mechanisms)),
            ];
        }
        if payload_contains(body, "<auth ") {
            return match outcome {
                AuthOutcome::Success => vec![Reply::Body(bodies::sasl_success())],
                AuthOutcome::Failure => vec![Reply::Body(bodies::sasl_failure(
                    "not-authorized",
                    Some("bad credentials"),
                ))],
                AuthOutcome::Silent => Vec::new(),
            };
        }
        if is_restart(body) {
            let features = if bind {
                bodies::features_with_bind()
            } else {
                bodies::wrap("<stream:features xmlns:stream='http://etherx.jabber.org/streams'/>")
            };
            return vec![Reply::Body(features)];
        }
        if payload_contains(body, bodies::BIND_NS) {
            let id = bodies::stanza_id(body.payload_xml()).expect("bind iq carries an id");
            return vec![Reply::Body(bodies::bind_result(&id, BOUND_JID))];
        }
        Vec::new()
    })
}

pub async fn next_event<P>(events: &mut Receiver<SessionEvent>, predicate: P) -> SessionEvent
where
    P: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("session event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Everything published so far, without waiting.
pub fn drain(events: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
