mod common;

use std::sync::Arc;

use authgate_core::notify::NotificationLevel;
use authgate_core::{ApiError, ApiRequest, AuthError, AuthErrorKind, AuthPhase};

use common::{eventually, session, FakeProvider, FakeTransport, Harness};

fn auth_kind(result: &Result<authgate_core::ApiResponse, ApiError>) -> Option<AuthErrorKind> {
    match result {
        Err(e) => e.auth_kind(),
        Ok(_) => None,
    }
}

#[tokio::test]
async fn test_attaches_bearer_only_with_session() {
    let h = Harness::new(FakeProvider::new());
    h.manager.init().await;
    let transport = Arc::new(FakeTransport::new("token-a"));
    let gateway = h.gateway(transport.clone());

    let response = gateway.send(ApiRequest::get("/public")).await.unwrap();
    assert_eq!(response.status, 200);

    // Unauthenticated 401s are the caller's business
    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 401);
    assert_eq!(transport.bearers(), vec![None, None]);
    assert_eq!(h.provider.refreshes(), 0);

    let h = Harness::signed_in(FakeProvider::new(), "token-a").await;
    let gateway = h.gateway(transport.clone());
    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(transport.bearers().last(), Some(&Some("token-a".to_string())));
}

#[tokio::test]
async fn test_refresh_success_retries_transparently() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let value: serde_json::Value = gateway.get_json("/units").await.expect("retried");
    assert_eq!(value["token"], "refreshed");

    assert_eq!(h.provider.refreshes(), 1);
    assert_eq!(
        transport.bearers(),
        vec![Some("token-old".to_string()), Some("refreshed".to_string())]
    );
    assert_eq!(h.manager.state().phase(), AuthPhase::SignedIn);
    assert_eq!(gateway.pending_len(), 0);
}

#[tokio::test]
async fn test_concurrent_401s_trigger_one_refresh() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    h.provider.refresh_gate.enable();
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.send(ApiRequest::get(format!("/units/{}", i))).await })
        })
        .collect();

    h.provider.refresh_gate.started.notified().await;
    eventually(|| gateway.pending_len() == 5).await;
    h.provider.refresh_gate.release.notify_one();

    for task in tasks {
        let response = task.await.unwrap().expect("retried");
        assert_eq!(response.status, 200);
    }
    assert_eq!(h.provider.refreshes(), 1);
    assert_eq!(gateway.pending_len(), 0);
}

#[tokio::test]
async fn test_refresh_failure_rejects_every_queued_request() {
    let mut h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    h.provider.refresh_gate.enable();
    h.provider.set_refresh(Err(AuthError::from_kind(AuthErrorKind::RefreshFailed)));
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.send(ApiRequest::get("/units")).await })
        })
        .collect();

    h.provider.refresh_gate.started.notified().await;
    eventually(|| gateway.pending_len() == 3).await;
    h.provider.refresh_gate.release.notify_one();

    for task in tasks {
        let result = task.await.unwrap();
        assert_eq!(auth_kind(&result), Some(AuthErrorKind::SessionExpired));
    }
    assert_eq!(h.provider.refreshes(), 1);
    assert_eq!(h.manager.state().phase(), AuthPhase::SignedOut);
    assert!(h.manager.token_store().peek().is_none());
    assert_eq!(h.count(NotificationLevel::Warning), 1);
}

#[tokio::test]
async fn test_sign_out_during_refresh_rejects_queue() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    h.provider.refresh_gate.enable();
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.send(ApiRequest::get("/units")).await })
        })
        .collect();

    h.provider.refresh_gate.started.notified().await;
    eventually(|| gateway.pending_len() == 3).await;

    h.manager.sign_out().await;
    assert_eq!(h.manager.state().phase(), AuthPhase::SignedOut);

    for task in tasks {
        let result = task.await.unwrap();
        assert_eq!(auth_kind(&result), Some(AuthErrorKind::SessionExpired));
    }
    h.provider.refresh_gate.release.notify_one();
    assert!(h.manager.token_store().peek().is_none());
}

#[tokio::test]
async fn test_network_error_rejects_queue_but_keeps_session() {
    let mut h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    h.provider.set_refresh(Err(AuthError::network("connection reset")));
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let result = gateway.send(ApiRequest::get("/units")).await;
    assert_eq!(auth_kind(&result), Some(AuthErrorKind::NetworkError));

    assert!(h.manager.state().is_authenticated());
    assert_eq!(
        h.manager.token_store().get().map(|s| s.access_token),
        Some("token-old".to_string())
    );
    let notes = h.drain_notifications();
    assert!(notes
        .iter()
        .any(|n| n.level == NotificationLevel::Warning && n.title == "Connection problem"));

    // The next call retries the refresh
    h.provider.set_refresh(Ok(session("refreshed", 60)));
    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(h.provider.refreshes(), 2);
}

#[tokio::test]
async fn test_business_errors_pass_through() {
    let h = Harness::signed_in(FakeProvider::new(), "token-a").await;
    let transport = Arc::new(FakeTransport::new("token-a"));
    let gateway = h.gateway(transport.clone());

    let response = gateway.send(ApiRequest::get("/boom")).await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(transport.calls(), 1);
    assert_eq!(h.provider.refreshes(), 0);

    let err = gateway
        .get_json::<serde_json::Value>("/boom")
        .await
        .expect_err("server error");
    assert!(matches!(err, ApiError::ServerError(_)));
}

#[tokio::test]
async fn test_second_401_is_returned_to_caller() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    let transport = Arc::new(FakeTransport::new("never-valid"));
    let gateway = h.gateway(transport.clone());

    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 401);
    assert_eq!(transport.calls(), 2);
    assert_eq!(h.provider.refreshes(), 1);
}

#[tokio::test]
async fn test_superseded_token_retries_without_refresh() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    let transport = Arc::new(FakeTransport::new("token-new"));
    *transport.renew_on_401.lock().unwrap() =
        Some((h.manager.token_store().clone(), session("token-new", 60)));
    let gateway = h.gateway(transport.clone());

    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(h.provider.refreshes(), 0);
    assert_eq!(
        transport.bearers(),
        vec![Some("token-old".to_string()), Some("token-new".to_string())]
    );
}

#[tokio::test]
async fn test_expiring_session_is_refreshed_before_sending() {
    let h = Harness::signed_in(FakeProvider::new(), "token-old").await;
    h.manager.token_store().set(session("token-short", 2));
    let transport = Arc::new(FakeTransport::new("refreshed"));
    let gateway = h.gateway(transport.clone());

    let response = gateway.send(ApiRequest::get("/units")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(transport.bearers(), vec![Some("refreshed".to_string())]);
    assert_eq!(h.provider.refreshes(), 1);
}

#[tokio::test]
async fn test_post_json_round_trip() {
    let h = Harness::signed_in(FakeProvider::new(), "token-a").await;
    let transport = Arc::new(FakeTransport::new("token-a"));
    let gateway = h.gateway(transport);

    let value: serde_json::Value = gateway
        .post_json("/items", &serde_json::json!({"name": "tent"}))
        .await
        .expect("posted");
    assert_eq!(value["ok"], true);
}
