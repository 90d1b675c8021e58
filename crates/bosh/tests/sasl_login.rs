//! SASL login, stream restart and resource binding against a scripted server.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::{AuthOutcome, BOUND_JID, SID, connected, connection, login_server, next_event};
use waddle_bosh::body::{RESTART, SID as SID_ATTR, TO};
use waddle_bosh::{
    AttemptContext, ConnectionError, ConnectionEvent, SaslError, SaslMechanism, SessionEvent,
};
use waddle_test_support::bodies;
use waddle_test_support::bosh::{FakeBosh, Reply, is_restart, is_session_creation};

const TIMEOUT: Duration = Duration::from_secs(2);

fn auth_payloads(fake: &FakeBosh) -> Vec<String> {
    fake.sent_payloads()
        .into_iter()
        .filter(|payload| payload.starts_with("<auth "))
        .collect()
}

fn response_payloads(fake: &FakeBosh) -> Vec<String> {
    fake.sent_payloads()
        .into_iter()
        .filter(|payload| payload.starts_with("<response"))
        .collect()
}

fn element_text<'a>(payload: &'a str, tag: &str) -> &'a str {
    let start = payload.find('>').map_or(0, |index| index + 1);
    let end = payload.rfind(&format!("</{tag}>")).unwrap_or(payload.len());
    &payload[start..end]
}

/// Answers two challenges, then requires the server's success data to be `ok`.
#[derive(Debug, Default)]
struct TwoRound {
    round: usize,
    outcome: Option<Vec<u8>>,
}

impl SaslMechanism for TwoRound {
    fn name(&self) -> &'static str {
        "X-TWO-ROUND"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn new_instance(&self) -> Box<dyn SaslMechanism> {
        Box::new(TwoRound::default())
    }

    fn authentication_text(
        &mut self,
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        Ok(Some(b"hello".to_vec()))
    }

    fn evaluate_challenge(
        &mut self,
        challenge: &[u8],
        _context: &AttemptContext,
    ) -> Result<Option<Vec<u8>>, SaslError> {
        self.round += 1;
        if self.round > 2 {
            self.outcome = Some(challenge.to_vec());
            return Ok(None);
        }
        if challenge != format!("c{}", self.round).as_bytes() {
            return Err(SaslError::Local {
                mechanism: self.name().to_string(),
                message: format!("unexpected challenge in round {}", self.round),
            });
        }
        Ok(Some(format!("r{}", self.round).into_bytes()))
    }

    fn check_if_successful_or_throw(&self) -> Result<(), SaslError> {
        match self.outcome.as_deref() {
            Some(b"ok") => Ok(()),
            _ => Err(SaslError::Local {
                mechanism: self.name().to_string(),
                message: "server did not confirm the exchange".to_string(),
            }),
        }
    }
}

/// Walks `X-TWO-ROUND` through two challenges and ends with `success_data`.
fn two_round_server(success_data: &'static str) -> FakeBosh {
    FakeBosh::scripted(move |body| {
        if is_session_creation(body) {
            return vec![
                Reply::Body(bodies::session_created(SID, "stream-1")),
                Reply::Connected,
                Reply::Body(bodies::features_with_mechanisms(&["X-TWO-ROUND"])),
            ];
        }
        let payload = body.payload_xml();
        if payload.starts_with("<auth ") {
            return vec![Reply::Body(bodies::sasl_challenge(&STANDARD.encode("c1")))];
        }
        if payload.starts_with("<response") {
            let reply = match element_text(payload, "response") {
                "cjE=" => bodies::sasl_challenge(&STANDARD.encode("c2")),
                _ => bodies::sasl_success_with(&STANDARD.encode(success_data)),
            };
            return vec![Reply::Body(reply)];
        }
        if is_restart(body) {
            return vec![Reply::Body(bodies::wrap(
                "<stream:features xmlns:stream='http://etherx.jabber.org/streams'/>",
            ))];
        }
        Vec::new()
    })
}

/// A SCRAM-SHA-1 server that answers the client-first message properly but
/// signs its final message with the wrong key.
fn scram_server_with_bad_signature() -> FakeBosh {
    FakeBosh::scripted(|body| {
        if is_session_creation(body) {
            return vec![
                Reply::Body(bodies::session_created(SID, "stream-1")),
                Reply::Connected,
                Reply::Body(bodies::features_with_mechanisms(&["SCRAM-SHA-1"])),
            ];
        }
        let payload = body.payload_xml();
        if payload.starts_with("<auth ") {
            let client_first = STANDARD
                .decode(element_text(payload, "auth"))
                .expect("client-first message is base64");
            let client_first = String::from_utf8(client_first).expect("client-first is utf-8");
            let nonce = client_first
                .split(',')
                .find_map(|part| part.strip_prefix("r="))
                .expect("client-first carries a nonce");
            let server_first = format!("r={nonce}srv,s={},i=4096", STANDARD.encode("saltsalt"));
            return vec![Reply::Body(bodies::sasl_challenge(&STANDARD.encode(server_first)))];
        }
        if payload.starts_with("<response") {
            let server_final = format!("v={}", STANDARD.encode([0u8; 20]));
            return vec![Reply::Body(bodies::sasl_success_with(&STANDARD.encode(server_final)))];
        }
        Vec::new()
    })
}

#[tokio::test]
async fn plain_login_restarts_the_stream_and_binds_a_resource() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;
    let mut events = connection.subscribe();

    connection
        .login("alice", "secret", Some("laptop"))
        .await
        .unwrap();

    assert!(connection.is_authenticated());
    assert_eq!(
        connection.user().map(|jid| jid.to_string()).as_deref(),
        Some(BOUND_JID)
    );

    assert_eq!(
        auth_payloads(&fake),
        vec![
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHNlY3JldA==</auth>"
        ]
    );

    let sent = fake.sent();
    let restart = sent.iter().find(|body| is_restart(body)).unwrap();
    assert_eq!(restart.attribute(&RESTART), Some("true"));
    assert_eq!(restart.attribute(&TO), Some("example.com"));
    assert_eq!(restart.attribute(&SID_ATTR), Some(SID));
    assert_eq!(restart.namespace_definition("xmpp"), Some("urn:xmpp:xbosh"));

    assert!(
        fake.sent_payloads()
            .iter()
            .any(|payload| payload.contains("<resource>laptop</resource>"))
    );

    let event = next_event(&mut events, |event| {
        matches!(event, SessionEvent::Authenticated { .. })
    })
    .await;
    assert_matches!(event, SessionEvent::Authenticated { jid: Some(jid) } => {
        assert_eq!(jid.to_string(), BOUND_JID);
    });
}

#[tokio::test]
async fn login_without_bind_feature_has_no_bound_user() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, false);
    let connection = connected(&fake, TIMEOUT).await;

    connection.login("alice", "secret", None).await.unwrap();

    assert!(connection.is_authenticated());
    assert!(connection.user().is_none());
}

#[tokio::test]
async fn server_failure_is_reported_with_its_condition() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Failure, true);
    let connection = connected(&fake, TIMEOUT).await;

    let result = connection.login("alice", "wrong", None).await;

    assert_matches!(
        result,
        Err(ConnectionError::Sasl(SaslError::Failure { mechanism, condition, text })) => {
            assert_eq!(mechanism, "PLAIN");
            assert_eq!(condition, "not-authorized");
            assert_eq!(text.as_deref(), Some("bad credentials"));
        }
    );
    assert!(!connection.is_authenticated());
    assert!(!fake.sent().iter().any(is_restart));
}

#[tokio::test]
async fn silent_server_yields_no_response() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Silent, true);
    let connection = connected(&fake, Duration::from_millis(200)).await;

    let result = connection.login("alice", "secret", None).await;

    assert_matches!(result, Err(ConnectionError::NoResponse { waiting_for, timeout }) => {
        assert_eq!(waiting_for, "successful SASL authentication");
        assert_eq!(timeout, Duration::from_millis(200));
    });
    assert!(!connection.is_authenticated());
}

#[tokio::test]
async fn no_shared_mechanism_is_reported() {
    let fake = login_server(&["X-OAUTH2"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;

    let result = connection.login("alice", "secret", None).await;

    assert_matches!(
        result,
        Err(ConnectionError::Sasl(SaslError::NoSharedMechanism { offered })) => {
            assert_eq!(offered, vec!["X-OAUTH2".to_string()]);
        }
    );
    assert!(auth_payloads(&fake).is_empty());
}

#[tokio::test]
async fn scram_is_preferred_over_plain() {
    let fake = login_server(&["PLAIN", "SCRAM-SHA-1"], AuthOutcome::Failure, true);
    let connection = connected(&fake, TIMEOUT).await;

    let _ = connection.login("alice", "secret", None).await;

    let auth = auth_payloads(&fake);
    assert_eq!(auth.len(), 1);
    assert!(auth[0].contains("mechanism='SCRAM-SHA-1'"), "{}", auth[0]);
}

#[tokio::test]
async fn blacklisted_mechanisms_are_skipped() {
    let fake = login_server(&["PLAIN", "SCRAM-SHA-1"], AuthOutcome::Success, false);
    let connection = connected(&fake, TIMEOUT).await;
    connection.blacklist_mechanism("SCRAM-SHA-1");

    connection.login("alice", "secret", None).await.unwrap();

    assert!(auth_payloads(&fake)[0].contains("mechanism='PLAIN'"));
}

#[tokio::test]
async fn second_login_is_rejected() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;
    connection.login("alice", "secret", None).await.unwrap();

    assert_matches!(
        connection.login("alice", "secret", None).await,
        Err(ConnectionError::AlreadyLoggedIn)
    );
}

#[tokio::test]
async fn login_requires_a_connection() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connection(&fake, TIMEOUT);

    assert_matches!(
        connection.login("alice", "secret", None).await,
        Err(ConnectionError::NotConnected)
    );
}

#[tokio::test]
async fn reconnect_after_authentication_logs_in_again() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;
    connection
        .login("alice", "secret", Some("laptop"))
        .await
        .unwrap();
    let mut events = connection.subscribe();

    fake.fire(ConnectionEvent::Disconnected);
    fake.settle();
    assert!(!connection.is_authenticated());
    assert!(connection.was_authenticated());

    fake.fire(ConnectionEvent::Connected);
    fake.deliver(bodies::features_with_mechanisms(&["PLAIN"]));

    next_event(&mut events, |event| {
        matches!(event, SessionEvent::Authenticated { .. })
    })
    .await;
    assert!(connection.is_authenticated());
    assert_eq!(auth_payloads(&fake).len(), 2);
    assert!(
        fake.sent_payloads()
            .iter()
            .filter(|payload| payload.contains("<resource>laptop</resource>"))
            .count()
            == 2
    );
}

#[tokio::test]
async fn reconnect_without_prior_login_does_not_authenticate() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;

    fake.fire(ConnectionEvent::Disconnected);
    fake.fire(ConnectionEvent::Connected);
    fake.settle();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(connection.is_connected());
    assert!(!connection.is_authenticated());
    assert!(auth_payloads(&fake).is_empty());
}

#[tokio::test]
async fn failed_relogin_is_published_once() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, Duration::from_millis(200)).await;
    connection.login("alice", "secret", None).await.unwrap();
    let mut events = connection.subscribe();

    fake.fire(ConnectionEvent::Disconnected);
    fake.fire(ConnectionEvent::Connected);

    let event = next_event(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionError(_))
    })
    .await;
    assert_matches!(
        event,
        SessionEvent::ConnectionError(ConnectionError::NoResponse { .. })
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        !common::drain(&mut events)
            .iter()
            .any(|event| matches!(event, SessionEvent::ConnectionError(_)))
    );
    assert!(!connection.is_authenticated());
    assert_eq!(auth_payloads(&fake).len(), 1);
}

#[tokio::test]
async fn interrupt_aborts_a_pending_login() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Silent, true);
    let connection = connected(&fake, Duration::from_secs(30)).await;
    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.login("alice", "secret", None).await })
    };
    fake.wait_for_sent(TIMEOUT, |body| body.payload_xml().starts_with("<auth "))
        .await
        .expect("auth was sent");

    connection.interrupt();

    assert_matches!(
        pending.await.unwrap(),
        Err(ConnectionError::Interrupted { waiting_for }) => {
            assert_eq!(waiting_for, "successful SASL authentication");
        }
    );
}

#[tokio::test]
async fn multi_round_challenges_are_answered_through_the_connection() {
    let fake = two_round_server("ok");
    let connection = connected(&fake, TIMEOUT).await;
    connection.register_mechanism(Box::new(TwoRound::default()));

    connection.login("alice", "secret", None).await.unwrap();

    assert!(connection.is_authenticated());
    assert_eq!(
        auth_payloads(&fake),
        vec!["<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='X-TWO-ROUND'>aGVsbG8=</auth>"]
    );
    assert_eq!(
        response_payloads(&fake),
        vec![
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>cjE=</response>",
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>cjI=</response>",
        ]
    );
    assert!(fake.sent().iter().any(is_restart));
}

#[tokio::test]
async fn success_data_is_evaluated_before_the_attempt_succeeds() {
    let fake = two_round_server("no");
    let connection = connected(&fake, TIMEOUT).await;
    connection.register_mechanism(Box::new(TwoRound::default()));

    let result = connection.login("alice", "secret", None).await;

    assert_matches!(
        result,
        Err(ConnectionError::Sasl(SaslError::Local { mechanism, .. })) => {
            assert_eq!(mechanism, "X-TWO-ROUND");
        }
    );
    assert_eq!(response_payloads(&fake).len(), 2);
    assert!(!fake.sent().iter().any(is_restart));
}

#[tokio::test]
async fn scram_rejects_success_without_server_final_message() {
    let fake = login_server(&["SCRAM-SHA-1"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;

    let result = connection.login("alice", "secret", None).await;

    assert_matches!(
        result,
        Err(ConnectionError::Sasl(SaslError::Local { mechanism, .. })) => {
            assert_eq!(mechanism, "SCRAM-SHA-1");
        }
    );
    assert!(!connection.is_authenticated());
    assert!(!fake.sent().iter().any(is_restart));
}

#[tokio::test]
async fn scram_verifies_the_signature_in_success_data() {
    let fake = scram_server_with_bad_signature();
    let connection = connected(&fake, TIMEOUT).await;

    let result = connection.login("alice", "secret", None).await;

    assert_matches!(
        result,
        Err(ConnectionError::Sasl(SaslError::Local { mechanism, message })) => {
            assert_eq!(mechanism, "SCRAM-SHA-1");
            assert!(message.contains("signature"), "{message}");
        }
    );
    assert_eq!(response_payloads(&fake).len(), 1);
    assert!(!fake.sent().iter().any(is_restart));
}

#[tokio::test]
async fn relogin_cut_short_by_a_drop_leaves_the_session_reusable() {
    let fake = login_server(&["PLAIN"], AuthOutcome::Success, true);
    let connection = connected(&fake, TIMEOUT).await;
    connection.login("alice", "secret", None).await.unwrap();
    let mut events = connection.subscribe();

    fake.fire(ConnectionEvent::Disconnected);
    fake.fire(ConnectionEvent::Connected);
    fake.fire(ConnectionEvent::Disconnected);
    let event = next_event(&mut events, |event| {
        matches!(event, SessionEvent::ConnectionError(_))
    })
    .await;
    assert_matches!(
        event,
        SessionEvent::ConnectionError(ConnectionError::NotConnected)
    );

    fake.fire(ConnectionEvent::Connected);
    fake.deliver(bodies::features_with_mechanisms(&["PLAIN"]));
    next_event(&mut events, |event| {
        matches!(event, SessionEvent::Authenticated { .. })
    })
    .await;

    assert!(connection.is_connected());
    assert!(connection.is_authenticated());
    assert_eq!(auth_payloads(&fake).len(), 2);
}
