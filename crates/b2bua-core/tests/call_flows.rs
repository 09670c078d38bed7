//! End-to-end call flows through the facade with scripted collaborators
//!
//! Covers rejection before routing, route failover and huntstop codes,
//! group timeouts, tagless answers, cancellation during authorization,
//! credit limits, accounting and the media relay.

mod common;

use b2bua_core::common::status;
use b2bua_core::sip::Method;
use b2bua_core::{B2bua, B2buaConfig, CallHandle, CallState, LegSide, TransactionId, UaState};
use common::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const INGRESS_TID: &str = "server-1";

async fn place_call(b2b: &B2bua, cld: &str) -> CallHandle {
    let dialog = b2b.on_new_dialog(invite("1000", cld, Some(offer())), TransactionId::new(INGRESS_TID));
    assert!(dialog.response.is_none());
    let call = dialog.call.expect("call created");
    settle().await;
    call
}

fn ingress_tid() -> TransactionId {
    TransactionId::new(INGRESS_TID)
}

/// The egress UA and INVITE transaction of the current attempt
fn current_attempt(call: &CallHandle, tl: &MockTransport) -> (b2bua_core::UaId, TransactionId) {
    let ua = call.egress_ua().expect("egress placed");
    let (_, tid) = tl.invites().last().cloned().expect("INVITE sent");
    (ua, tid)
}

fn answer_call(call: &CallHandle, tl: &MockTransport) {
    let (ua, tid) = current_attempt(call, tl);
    call.recv_response(ua, tid.clone(), response(180, "Ringing", Some("callee-tag"), None));
    call.recv_response(ua, tid, response(200, "OK", Some("callee-tag"), Some(answer())));
}

#[tokio::test]
async fn test_missing_destination_never_routes() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1"]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer.clone()), None, None);

    let call = place_call(&b2b, "").await;

    let final_response = tl.final_response(&ingress_tid()).unwrap();
    assert_eq!(final_response.code, 500);
    assert_eq!(final_response.reason, status::REASON_NO_CLD);
    assert_eq!(call.state(), CallState::Disconnecting);
    assert_eq!(authorizer.calls.load(Ordering::SeqCst), 0);
    assert!(tl.invites().is_empty());
}

#[tokio::test]
async fn test_huntstop_code_ends_hunting() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&[
        "2000@192.0.2.1;huntstop_scodes=486",
        "2000@192.0.2.2",
    ]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;

    let (ua, tid) = current_attempt(&call, &tl);
    assert_eq!(tl.invites()[0].0.target, addr("192.0.2.1:5060"));
    call.recv_response(ua, tid, response(486, "Busy Here", Some("callee-tag"), None));

    assert_eq!(tl.invites().len(), 1);
    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, 486);
    assert_eq!(call.state(), CallState::Disconnecting);
}

#[tokio::test]
async fn test_failover_to_next_route_then_connect() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1", "2000@192.0.2.2"]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;

    let (first_ua, first_tid) = current_attempt(&call, &tl);
    call.recv_response(first_ua, first_tid, response(500, "Server Error", Some("gw1"), None));

    // caller never hears about the first failure
    assert!(tl.final_response(&ingress_tid()).is_none());
    let invites = tl.invites();
    assert_eq!(invites.len(), 2);
    let (second, _) = &invites[1];
    assert_eq!(second.target, addr("192.0.2.2:5060"));
    assert_eq!(second.call_id, "abc123@caller-b2b_2");
    assert_eq!(second.max_forwards, Some(69));
    assert_ne!(call.egress_ua(), Some(first_ua));

    answer_call(&call, &tl);
    let responses = tl.responses_to(&ingress_tid());
    assert_eq!(responses.iter().map(|r| r.code).collect::<Vec<_>>(), vec![180, 200]);
    assert_eq!(responses[1].body.as_ref(), Some(&answer()));
    assert_eq!(call.state(), CallState::Connected);
    assert_eq!(tl.acks().len(), 1);

    // caller hangs up
    let bye_tid = TransactionId::new("server-bye");
    call.recv_request(call.ingress_ua(), caller_request(Method::Bye), bye_tid.clone());
    assert_eq!(tl.responses_to(&bye_tid)[0].code, 200);
    let byes = tl.requests(Method::Bye);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].0.target, addr("192.0.2.2:5060"));
    assert_eq!(call.state(), CallState::Disconnecting);
}

#[tokio::test]
async fn test_no_forward_on_fail_masks_last_failure() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1;forward_on_fail=0"]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;

    let (ua, tid) = current_attempt(&call, &tl);
    call.recv_response(ua, tid, response(486, "Busy Here", Some("gw"), None));

    let final_response = tl.final_response(&ingress_tid()).unwrap();
    assert_eq!(final_response.code, 500);
    assert_eq!(final_response.reason, status::REASON_NO_ROUTE);
}

#[tokio::test(start_paused = true)]
async fn test_tagless_answer_fails_call_and_legs_die() {
    let tl = Arc::new(MockTransport::default());
    let config = B2buaConfig::default().with_static_route("2000@192.0.2.1");
    let b2b = b2bua(config, tl.clone(), None, None, None);
    let call = place_call(&b2b, "2000").await;

    let (ua, tid) = current_attempt(&call, &tl);
    call.recv_response(ua, tid, response(200, "OK", None, Some(answer())));

    assert_eq!(tl.requests(Method::Bye).len(), 1);
    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, status::BAD_GATEWAY);
    assert_eq!(call.with(|c| c.egress().map(|ua| ua.state())), Some(UaState::Failed));
    assert_eq!(b2b.registry().len(), 1);

    tokio::time::sleep(GO_DEAD + Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(call.with(|c| c.egress().map(|ua| ua.state())), Some(UaState::Dead));
    assert_eq!(call.state(), CallState::Dead);
    assert!(b2b.registry().is_empty());
}

#[tokio::test]
async fn test_cancel_while_authorizing_abandons_lookup() {
    let tl = Arc::new(MockTransport::default());
    let gate = Arc::new(Notify::new());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1"]).held(gate.clone()));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer.clone()), None, None);
    let call = place_call(&b2b, "2000").await;

    assert_eq!(call.state(), CallState::WaitRoute);
    assert_eq!(authorizer.calls.load(Ordering::SeqCst), 1);

    call.recv_cancel(call.ingress_ua());
    settle().await;
    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, 487);
    assert!(authorizer.abandoned.load(Ordering::SeqCst));

    gate.notify_waiters();
    settle().await;
    assert!(tl.invites().is_empty());
    assert_eq!(call.state(), CallState::Disconnecting);
}

#[tokio::test]
async fn test_authorizer_rejection_and_zero_credit() {
    let tl = Arc::new(MockTransport::default());
    let b2b = b2bua(
        B2buaConfig::default(),
        tl.clone(),
        Some(Arc::new(ScriptedAuthorizer::reject())),
        None,
        None,
    );
    place_call(&b2b, "2000").await;
    let rejected = tl.final_response(&ingress_tid()).unwrap();
    assert_eq!((rejected.code, rejected.reason.as_str()), (403, "Auth Failed"));

    let tl = Arc::new(MockTransport::default());
    let broke = ScriptedAuthorizer::with_attributes(vec![
        ("h323-ivr-in".into(), "Routing:2000@192.0.2.1".into()),
        ("h323-credit-time".into(), "0".into()),
    ]);
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(Arc::new(broke)), None, None);
    place_call(&b2b, "2000").await;
    let rejected = tl.final_response(&ingress_tid()).unwrap();
    assert_eq!((rejected.code, rejected.reason.as_str()), (403, "No Credit"));
    assert!(tl.invites().is_empty());
}

#[tokio::test]
async fn test_authorizer_overrides_and_request() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::with_attributes(vec![
        ("h323-ivr-in".into(), "Routing:sip-ua".into()),
        ("h323-ivr-in".into(), "CLI:5550000".into()),
        ("h323-ivr-in".into(), "CNAM:Front Desk".into()),
    ]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer.clone()), None, None);
    place_call(&b2b, "2000").await;

    let request = authorizer.last_request.lock().clone().unwrap();
    assert_eq!(request.caller, "1000");
    assert_eq!(request.callee, "2000");
    assert_eq!(request.source, addr(CALLER_ADDR));

    let (egress, _) = &tl.invites()[0];
    // reflected back to the caller
    assert_eq!(egress.target, addr(CALLER_ADDR));
    assert_eq!(egress.from.uri.user.as_deref(), Some("5550000"));
    assert_eq!(egress.from.display_name.as_deref(), Some("Front Desk"));
    assert_eq!(egress.request_uri.user.as_deref(), Some("2000"));
}

#[tokio::test(start_paused = true)]
async fn test_group_timeout_in_last_group_keeps_attempt() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1;gt=5,3", "2000@192.0.2.2"]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;
    let (ua, tid) = current_attempt(&call, &tl);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    assert!(!tl.cancelled(&tid));
    assert_eq!(call.egress_ua(), Some(ua));
    assert_eq!(call.with(|c| c.routes_left()), 0);

    // hunting is over: the next failure goes straight to the caller
    call.recv_response(ua, tid, response(503, "Service Unavailable", Some("gw"), None));
    assert_eq!(tl.invites().len(), 1);
    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, 503);
}

#[tokio::test(start_paused = true)]
async fn test_group_timeout_skips_to_cutoff_rank() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&[
        "2000@192.0.2.1;gt=5,3",
        "2000@192.0.2.2",
        "2000@192.0.2.3",
        "2000@192.0.2.4",
    ]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;
    let (_, first_tid) = current_attempt(&call, &tl);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    assert!(tl.cancelled(&first_tid));
    let invites = tl.invites();
    assert_eq!(invites.len(), 2);
    assert_eq!(invites[1].0.target, addr("192.0.2.3:5060"));
    assert_eq!(call.with(|c| c.routes_left()), 1);
    assert!(tl.final_response(&ingress_tid()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_group_timeout_ranks_skip_unresolved_routes() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&[
        "2000@192.0.2.1;gt=5,3",
        "2000@192.0.2.2",
        // outbound proxy has no usable port, so this route never resolves
        "2000@192.0.2.3;po_proxy=proxy.example.net:none",
        "2000@192.0.2.4",
        "2000@192.0.2.5",
    ]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;
    let (_, first_tid) = current_attempt(&call, &tl);
    assert_eq!(call.with(|c| c.routes_left()), 3);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    assert!(tl.cancelled(&first_tid));
    let targets: Vec<_> = tl.invites().iter().map(|(r, _)| r.target).collect();
    assert_eq!(targets, vec![addr("192.0.2.1:5060"), addr("192.0.2.4:5060")]);
    assert_eq!(call.info().rnum, Some(3));
    assert_eq!(call.with(|c| c.routes_left()), 1);
    assert!(tl.final_response(&ingress_tid()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_no_reply_timeout_fails_over() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::accept(&["2000@192.0.2.1", "2000@192.0.2.2"]));
    let config = B2buaConfig::default().with_no_reply_time(Duration::from_secs(2));
    let b2b = b2bua(config, tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;
    let (_, first_tid) = current_attempt(&call, &tl);

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;

    assert!(tl.cancelled(&first_tid));
    assert_eq!(tl.invites().len(), 2);
    assert!(tl.final_response(&ingress_tid()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_credit_time_disconnects_both_legs() {
    let tl = Arc::new(MockTransport::default());
    let authorizer = Arc::new(ScriptedAuthorizer::with_attributes(vec![
        ("h323-ivr-in".into(), "Routing:2000@192.0.2.1".into()),
        ("h323-credit-time".into(), "30".into()),
    ]));
    let b2b = b2bua(B2buaConfig::default(), tl.clone(), Some(authorizer), None, None);
    let call = place_call(&b2b, "2000").await;
    answer_call(&call, &tl);
    assert_eq!(call.state(), CallState::Connected);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(tl.requests(Method::Bye).is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    let byes = tl.requests(Method::Bye);
    assert_eq!(byes.len(), 2);
    let targets: Vec<_> = byes.iter().map(|(r, _)| r.target.to_string()).collect();
    assert!(targets.contains(&"192.0.2.1:5060".to_string()));
    assert!(targets.contains(&CALLER_ADDR.to_string()));
}

#[tokio::test]
async fn test_caller_cancel_while_ringing() {
    let tl = Arc::new(MockTransport::default());
    let config = B2buaConfig::default().with_static_route("2000@192.0.2.1");
    let b2b = b2bua(config, tl.clone(), None, None, None);
    let call = place_call(&b2b, "2000").await;
    let (ua, tid) = current_attempt(&call, &tl);
    call.recv_response(ua, tid.clone(), response(180, "Ringing", Some("callee-tag"), None));

    call.recv_cancel(call.ingress_ua());

    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, 487);
    assert!(tl.cancelled(&tid));
    assert_eq!(call.state(), CallState::Disconnecting);
}

#[tokio::test]
async fn test_accounting_sees_both_legs() {
    let tl = Arc::new(MockTransport::default());
    let accounting = Arc::new(RecordingAccounting::default());
    let config = B2buaConfig::default().with_static_route("2000@192.0.2.1");
    let b2b = b2bua(config, tl.clone(), None, Some(accounting.clone()), None);
    let call = place_call(&b2b, "2000").await;
    answer_call(&call, &tl);
    call.recv_request(call.ingress_ua(), caller_request(Method::Bye), TransactionId::new("bye"));

    let events: Vec<(&str, LegSide)> = accounting
        .events
        .lock()
        .iter()
        .map(|(kind, report)| (*kind, report.side))
        .collect();
    assert_eq!(
        events,
        vec![
            ("connect", LegSide::Originate),
            ("connect", LegSide::Answer),
            ("disconnect", LegSide::Answer),
            ("disconnect", LegSide::Originate),
        ]
    );
    let egress_report = accounting.events.lock()[3].1.clone();
    assert_eq!(egress_report.call_id, "abc123@caller-b2b_1");
    assert!(egress_report.duration().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_media_relay_session_lifecycle() {
    let tl = Arc::new(MockTransport::default());
    let relay = Arc::new(RecordingRelay::default());
    let config = B2buaConfig::default()
        .with_static_route("2000@192.0.2.1")
        .with_media_relay(true);
    let b2b = b2bua(config, tl.clone(), None, None, Some(relay.clone()));
    let call = place_call(&b2b, "2000").await;

    let (egress, _) = &tl.invites()[0];
    let sent_offer = egress.body.as_ref().and_then(|b| b.as_text()).unwrap().to_string();
    assert!(sent_offer.contains("a=relayed-caller"));
    assert_eq!(*relay.callee_targets.lock(), vec![addr("192.0.2.1:5060")]);

    answer_call(&call, &tl);
    let ok = tl.final_response(&ingress_tid()).unwrap();
    assert!(ok.body.as_ref().and_then(|b| b.as_text()).unwrap().contains("a=relayed-callee"));

    call.recv_request(call.ingress_ua(), caller_request(Method::Bye), TransactionId::new("bye"));
    assert_eq!(relay.deleted.load(Ordering::SeqCst), 1);

    tokio::time::sleep(GO_DEAD + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(call.state(), CallState::Dead);
    assert_eq!(relay.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(relay.deleted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_payload_filter_rejects_empty_intersection() {
    let tl = Arc::new(MockTransport::default());
    let config = B2buaConfig::default()
        .with_static_route("2000@192.0.2.1")
        .with_allowed_pts(vec![18]);
    let b2b = b2bua(config, tl.clone(), None, None, None);
    place_call(&b2b, "2000").await;

    assert_eq!(tl.final_response(&ingress_tid()).unwrap().code, 488);
    assert!(tl.invites().is_empty());
}

#[tokio::test]
async fn test_admin_disconnect_all() {
    let tl = Arc::new(MockTransport::default());
    let config = B2buaConfig::default().with_static_route("2000@192.0.2.1");
    let b2b = b2bua(config, tl.clone(), None, None, None);
    let call = place_call(&b2b, "2000").await;
    answer_call(&call, &tl);

    let listed = b2b.list_calls();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, CallState::Connected);
    assert_eq!(listed[0].rnum, Some(1));

    assert_eq!(b2b.disconnect_all(), 1);
    assert_eq!(tl.requests(Method::Bye).len(), 2);
    assert_eq!(b2b.list_calls()[0].state, CallState::Disconnecting);
}
