//! End-to-end session flows against a scripted wiremock gateway.

mod common;

use common::*;
use nostr::{JsonUtil, Keys};
use std::time::Duration;
use tollgated::chandler::{Chandler, SessionStatus};
use tollgated::config::{ChandlerConfig, TrustConfig, TrustPolicy};
use tollgated::errors::ChandlerError;
use tollgated::protocol::{build_notice_event, Metric};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_ip(server: &MockServer) -> String {
    server.address().ip().to_string()
}

#[tokio::test]
async fn happy_path_buys_a_time_session() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    let responder = SessionResponder::new(
        vec![gateway_keys.clone()],
        Metric::Milliseconds,
        vec![60_000],
    );
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    chandler.handle_upstream_tollgate(up).await.unwrap();

    let session = chandler.get_session(&gateway_pubkey).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.total_allotment, 60_000);
    assert_eq!(session.total_spent_sats, 2);
    assert_eq!(session.payment_count, 1);
    assert!(session.tracker.is_live());
    assert!(session.last_payment_at.is_some());

    assert_eq!(wallet.minted_total(), 2);
    assert_eq!(chandler.get_active_sessions().await.len(), 1);
}

#[tokio::test]
async fn renewal_replaces_the_total_allotment() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    // the second session event carries the new total, not an increment
    let responder =
        SessionResponder::new(vec![gateway_keys.clone()], Metric::Milliseconds, vec![500, 1_000]);
    let payments = responder.payments.clone();
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let config = ChandlerConfig {
        preferred_session_increments_milliseconds: 500,
        millisecond_renewal_offset: 100,
        max_price_per_millisecond: 0.01,
        ..ChandlerConfig::default()
    };
    let chandler = Chandler::new(config, server.address().port(), wallet.clone());

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        500,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    chandler.handle_upstream_tollgate(up).await.unwrap();

    // renewal fires at 400 ms of usage; the next one not before 900 ms
    tokio::time::sleep(Duration::from_millis(650)).await;

    let session = chandler.get_session(&gateway_pubkey).await.unwrap();
    assert_eq!(session.payment_count, 2);
    assert_eq!(session.total_allotment, 1_000);
    assert_eq!(session.total_spent_sats, 4);
    assert!(session.last_renewal_at.is_some());
    assert!(session.tracker.is_live());
    assert_eq!(payments.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn trust_denial_stops_before_any_payment() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    let trusted_other = Keys::generate();

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let config = ChandlerConfig {
        trust: TrustConfig {
            default_policy: TrustPolicy::TrustNone,
            allowlist: [trusted_other.public_key().to_hex()].into_iter().collect(),
            blocklist: Default::default(),
        },
        ..ChandlerConfig::default()
    };
    let chandler = Chandler::new(config, server.address().port(), wallet.clone());

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    let err = chandler.handle_upstream_tollgate(up).await.unwrap_err();
    assert!(matches!(err, ChandlerError::TrustDenied(_)));

    assert!(chandler.get_session(&gateway_pubkey).await.is_none());
    assert!(wallet.minted.lock().unwrap().is_empty());
    // pipeline aborted before any HTTP left the daemon
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn new_gateway_on_same_interface_replaces_the_session() {
    let server = MockServer::start().await;
    let g1 = Keys::generate();
    let g2 = Keys::generate();
    let responder = SessionResponder::new(
        vec![g1.clone(), g2.clone()],
        Metric::Milliseconds,
        vec![60_000],
    );
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up1 = upstream(
        "wlan0",
        &gateway_ip(&server),
        &g1,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let pk1 = up1.gateway_pubkey().to_string();
    chandler.handle_upstream_tollgate(up1).await.unwrap();
    let g1_tracker = chandler.get_session(&pk1).await.unwrap().tracker.clone();

    // stray IfUp, same interface, different gateway
    let up2 = upstream(
        "wlan0",
        &gateway_ip(&server),
        &g2,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let pk2 = up2.gateway_pubkey().to_string();
    chandler.handle_upstream_tollgate(up2).await.unwrap();

    let active = chandler.get_active_sessions().await;
    assert_eq!(active.len(), 1);
    assert!(active.contains_key(&pk2));
    assert!(chandler.get_session(&pk1).await.is_none());
    assert!(!g1_tracker.is_live());
}

#[tokio::test]
async fn link_flap_expires_then_rediscovers() {
    let server = MockServer::start().await;
    let g1 = Keys::generate();
    let g2 = Keys::generate();
    let responder = SessionResponder::new(
        vec![g1.clone(), g2.clone()],
        Metric::Milliseconds,
        vec![60_000],
    );
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up1 = upstream(
        "wlan0",
        &gateway_ip(&server),
        &g1,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let pk1 = up1.gateway_pubkey().to_string();
    chandler.handle_upstream_tollgate(up1).await.unwrap();
    let g1_tracker = chandler.get_session(&pk1).await.unwrap().tracker.clone();

    chandler.handle_disconnect("wlan0").await.unwrap();
    assert!(chandler.get_active_sessions().await.is_empty());
    assert!(chandler.get_session(&pk1).await.is_none());
    assert!(!g1_tracker.is_live());

    // link back up against a different gateway
    let up2 = upstream(
        "wlan0",
        &gateway_ip(&server),
        &g2,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let pk2 = up2.gateway_pubkey().to_string();
    chandler.handle_upstream_tollgate(up2).await.unwrap();

    let active = chandler.get_active_sessions().await;
    assert_eq!(active.len(), 1);
    assert!(active.contains_key(&pk2));
    assert_eq!(active[&pk2].upstream.interface_name, "wlan0");
}

#[tokio::test]
async fn existing_gateway_session_is_recovered_without_payment() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    Mock::given(method("GET"))
        .and(path("/usage"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("3000/60000", "text/plain"))
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    chandler.handle_upstream_tollgate(up).await.unwrap();

    let session = chandler.get_session(&gateway_pubkey).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.total_allotment, 60_000);
    assert_eq!(session.payment_count, 0);
    assert_eq!(session.total_spent_sats, 0);
    assert!(session.last_payment_at.is_none());
    assert!(session.tracker.is_live());
    assert!(wallet.minted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn notice_response_is_a_payment_rejection() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    let notice = build_notice_event(&gateway_keys, "payment-error", "token already spent").unwrap();
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(notice.as_json(), "application/json"))
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    let err = chandler.handle_upstream_tollgate(up).await.unwrap_err();
    assert!(matches!(err, ChandlerError::PaymentRejected(_)));
    assert!(chandler.get_session(&gateway_pubkey).await.is_none());
}

#[tokio::test]
async fn http_402_is_a_payment_rejection() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
        .mount(&server)
        .await;

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let err = chandler.handle_upstream_tollgate(up).await.unwrap_err();
    assert!(matches!(err, ChandlerError::PaymentRejected(_)));
}

#[tokio::test]
async fn underfunded_wallet_blocks_the_purchase() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();

    let wallet = MockWallet::with_balance(MINT_A, 1);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        60_000,
        &[pricing(2, MINT_A, 1)],
    );
    let err = chandler.handle_upstream_tollgate(up).await.unwrap_err();
    assert!(matches!(err, ChandlerError::InsufficientFunds { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn over_budget_pricing_is_refused() {
    let server = MockServer::start().await;
    let gateway_keys = Keys::generate();

    let wallet = MockWallet::with_balance(MINT_A, 1_000);
    let chandler = Chandler::new(
        ChandlerConfig::default(),
        server.address().port(),
        wallet.clone(),
    );

    // 2 sats per 100 ms step is 0.02 sat/ms, over the default budget
    let up = upstream(
        "wlan0",
        &gateway_ip(&server),
        &gateway_keys,
        Metric::Milliseconds,
        100,
        &[pricing(2, MINT_A, 1)],
    );
    let gateway_pubkey = up.gateway_pubkey().to_string();

    let err = chandler.handle_upstream_tollgate(up).await.unwrap_err();
    assert!(matches!(err, ChandlerError::BudgetExceeded { .. }));
    assert!(chandler.get_session(&gateway_pubkey).await.is_none());
}
