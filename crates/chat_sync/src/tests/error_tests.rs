use super::*;
use anyhow::anyhow;

#[test]
fn api_error_codes_map_onto_sync_taxonomy() {
    let auth = SyncError::from_api_error(&ApiError::new(ErrorCode::Unauthorized, "expired"));
    assert!(auth.requires_reauth());

    let missing = SyncError::from_api_error(&ApiError::new(ErrorCode::NotFound, "gone"));
    assert_eq!(missing, SyncError::RoomNotFound("gone".into()));

    let busy = SyncError::from_api_error(&ApiError::new(ErrorCode::RateLimited, "slow down"));
    assert!(busy.is_transient());
}

#[test]
fn status_without_json_body_falls_back_to_status_mapping() {
    let err = SyncError::from_status(404, "no such conversation");
    assert!(matches!(err, SyncError::RoomNotFound(_)));

    let err = SyncError::from_status(502, "bad gateway");
    assert!(err.is_transient());
}

#[test]
fn status_with_api_error_body_uses_body_code() {
    let body = r#"{"code":"validation","message":"body too long"}"#;
    assert_eq!(
        SyncError::from_status(400, body),
        SyncError::Validation("body too long".into())
    );
}

#[test]
fn classify_finds_sync_error_inside_context_chain() {
    let err = anyhow::Error::new(SyncError::AuthExpired("token".into())).context("poll failed");
    assert_eq!(
        SyncError::classify(&err),
        SyncError::AuthExpired("token".into())
    );
}

#[test]
fn classify_treats_json_errors_as_validation() {
    let decode = serde_json::from_str::<u32>("not json").expect_err("must fail");
    let err = anyhow::Error::new(decode).context("decode poll response");
    assert!(matches!(SyncError::classify(&err), SyncError::Validation(_)));
}

#[test]
fn classify_falls_back_to_message_heuristics() {
    assert!(SyncError::classify(&anyhow!("connection refused")).is_transient());
    assert!(SyncError::classify(&anyhow!("server said: unauthorized")).requires_reauth());
}

#[test]
fn websocket_errors_are_classified_by_kind_not_text() {
    let io = std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connect to 127.0.0.1:4040 failed",
    );
    let err = anyhow::Error::new(WsError::Io(io)).context("failed to open ws://127.0.0.1:4040/ws");
    assert!(SyncError::classify(&err).is_transient());

    let err = anyhow::Error::new(WsError::ConnectionClosed).context("invalid frame from 404 proxy");
    assert!(SyncError::classify(&err).is_transient());
}

#[test]
fn refused_websocket_upgrade_uses_http_status() {
    let response = tokio_tungstenite::tungstenite::http::Response::builder()
        .status(401)
        .body(None)
        .expect("response");
    let err = anyhow::Error::new(WsError::Http(response)).context("push upgrade");
    assert!(SyncError::classify(&err).requires_reauth());
}
