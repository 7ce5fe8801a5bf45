//! Connection lifecycle tests against the in-process stub server:
//! handshake, dispatch/wait, noreply draining, teardown and reader failure.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use common::{spawn_stub, spawn_stub_with_handshake, wait_until, StubReply};
use rilldb_client::{CloseOptions, Connection, DriverError, RunOptions, RunResult};

async fn connect(addr: std::net::SocketAddr) -> Connection {
    Connection::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .connect()
        .await
        .expect("connect failed")
}

#[tokio::test]
async fn test_atom_query() {
    let addr = spawn_stub(|_, query| {
        assert_eq!(query[0], json!(1));
        assert_eq!(query[1], json!("abc"));
        StubReply::Json(json!({"t": 1, "r": [42]}))
    })
    .await;

    let conn = connect(addr).await;
    let result = conn.run(json!("abc"), RunOptions::new()).await.unwrap();
    assert_eq!(result.into_atom(), Some(json!(42)));
}

#[tokio::test]
async fn test_handshake_failure() {
    let addr = spawn_stub_with_handshake(b"ERROR: unauthorized\0".to_vec(), |_, _| {
        StubReply::Silent
    })
    .await;

    let err = Connection::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .connect()
        .await
        .unwrap_err();
    match err {
        DriverError::Handshake(msg) => assert_eq!(msg, "ERROR: unauthorized"),
        other => panic!("expected handshake failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_on_closed_connection() {
    let addr = spawn_stub(|_, query| match query[0].as_u64() {
        Some(4) => StubReply::Json(json!({"t": 4, "r": []})),
        _ => StubReply::Json(json!({"t": 1, "r": [null]})),
    })
    .await;

    let conn = connect(addr).await;
    conn.close().await.unwrap();
    assert!(!conn.is_open());

    let err = conn.run(json!("abc"), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, DriverError::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_noreply_roundtrip() {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let addr = spawn_stub(move |_, query| {
        record.lock().unwrap().push(query.clone());
        match query[0].as_u64() {
            Some(4) => StubReply::Json(json!({"t": 4, "r": []})),
            _ => StubReply::Silent,
        }
    })
    .await;

    let conn = connect(addr).await;
    let result = conn
        .run(json!("abc"), RunOptions::new().noreply(true))
        .await
        .unwrap();
    assert!(matches!(result, RunResult::Noreply));

    // The drain completes only after the server has seen the noreply frame.
    conn.noreply_wait().await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0][0], json!(1));
    assert_eq!(seen[0][2]["noreply"], json!(true));
    assert_eq!(seen[1][0], json!(4));
}

#[tokio::test]
async fn test_closed_mid_wait_is_not_timeout() {
    let addr = spawn_stub(|_, _| StubReply::Silent).await;
    let conn = connect(addr).await;

    let mut blocked = Vec::new();
    for _ in 0..2 {
        let conn = conn.clone();
        blocked.push(tokio::spawn(async move {
            conn.run(json!("abc"), RunOptions::new()).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.close_with(CloseOptions {
        noreply_wait: false,
    })
    .await
    .unwrap();

    for task in blocked {
        let err = task.await.unwrap().unwrap_err();
        assert!(
            matches!(err, DriverError::ConnectionClosed(_)),
            "expected ConnectionClosed, got {:?}",
            err
        );
    }
}

#[tokio::test]
async fn test_reader_failure_fans_out() {
    let addr = spawn_stub(|_, _| StubReply::Hangup).await;
    let conn = connect(addr).await;

    let err = conn.run(json!("abc"), RunOptions::new()).await.unwrap_err();
    assert!(
        err.to_string().contains("Connection closed"),
        "unexpected error: {}",
        err
    );
    assert!(wait_until(|| !conn.is_open(), Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_split_response_frame_reassembles() {
    let addr = spawn_stub(|_, _| StubReply::Split(json!({"t": 1, "r": [7]}))).await;

    let conn = connect(addr).await;
    let result = conn.run(json!("abc"), RunOptions::new()).await.unwrap();
    assert_eq!(result.into_atom(), Some(json!(7)));
}

#[tokio::test]
async fn test_profile_wrapping() {
    let addr = spawn_stub(|_, _| {
        StubReply::Json(json!({"t": 1, "r": [7], "p": {"duration": 0.5}}))
    })
    .await;

    let conn = connect(addr).await;
    match conn.run(json!("abc"), RunOptions::new()).await.unwrap() {
        RunResult::Profiled { profile, value } => {
            assert_eq!(profile, json!({"duration": 0.5}));
            assert_eq!(value.into_atom(), Some(json!(7)));
        }
        other => panic!("expected profiled result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_runtime_error() {
    let addr = spawn_stub(|_, _| {
        StubReply::Json(json!({"t": 18, "r": ["table missing"], "b": [0, 1]}))
    })
    .await;

    let conn = connect(addr).await;
    let err = conn.run(json!("abc"), RunOptions::new()).await.unwrap_err();
    match err {
        DriverError::Runtime { msg, backtrace } => {
            assert_eq!(msg, "table missing");
            assert_eq!(backtrace, Some(json!([0, 1])));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
    // The failed query does not poison the connection.
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_default_db_injection() {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let addr = spawn_stub(move |_, query| {
        record.lock().unwrap().push(query.clone());
        StubReply::Json(json!({"t": 1, "r": [null]}))
    })
    .await;

    let conn = Connection::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .db("marina")
        .connect()
        .await
        .unwrap();

    conn.run(json!("abc"), RunOptions::new()).await.unwrap();
    conn.use_db("harbor");
    conn.run(json!("abc"), RunOptions::new()).await.unwrap();
    conn.run(json!("abc"), RunOptions::new().db("override"))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0][2]["db"], json!([14, ["marina"]]));
    assert_eq!(seen[1][2]["db"], json!([14, ["harbor"]]));
    assert_eq!(seen[2][2]["db"], json!([14, ["override"]]));
}

#[tokio::test]
async fn test_conn_id_increases_across_reconnects() {
    let addr = spawn_stub(|_, query| match query[0].as_u64() {
        Some(4) => StubReply::Json(json!({"t": 4, "r": []})),
        _ => StubReply::Silent,
    })
    .await;

    let conn = connect(addr).await;
    assert_eq!(conn.conn_id(), 1);

    conn.reconnect().await.unwrap();
    assert_eq!(conn.conn_id(), 2);
    assert!(conn.is_open());

    conn.reset().await.unwrap();
    assert_eq!(conn.conn_id(), 3);
}

#[tokio::test]
async fn test_noreply_wait_rejects_wrong_response() {
    let addr = spawn_stub(|_, _| StubReply::Json(json!({"t": 1, "r": [null]}))).await;

    let conn = connect(addr).await;
    let err = conn.noreply_wait().await.unwrap_err();
    assert!(matches!(err, DriverError::Protocol(_)));
}

#[tokio::test]
async fn test_tokens_are_unique_per_connection() {
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let addr = spawn_stub(move |token, _| {
        record.lock().unwrap().push(token);
        StubReply::Json(json!({"t": 1, "r": [null]}))
    })
    .await;

    let conn = connect(addr).await;
    for _ in 0..4 {
        conn.run(json!("abc"), RunOptions::new()).await.unwrap();
    }

    let mut tokens = seen.lock().unwrap().clone();
    let unsorted = tokens.clone();
    tokens.sort_unstable();
    tokens.dedup();
    assert_eq!(tokens.len(), 4, "tokens reused: {:?}", unsorted);
    assert_eq!(unsorted, tokens, "tokens not monotonic: {:?}", unsorted);
}

#[tokio::test]
async fn test_repl_slots() {
    let addr = spawn_stub(|_, _| StubReply::Json(json!({"t": 1, "r": [null]}))).await;

    let conn = connect(addr).await;
    conn.repl();
    let default = rilldb_client::repl::default().expect("default connection not installed");
    assert_eq!(default.conn_id(), conn.conn_id());
    assert!(rilldb_client::repl::last().is_some());
    rilldb_client::repl::clear_default();
    assert!(rilldb_client::repl::default().is_none());
}

#[tokio::test]
async fn test_run_with_closes_cursor() {
    let stops: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let record = Arc::clone(&stops);
    let addr = spawn_stub(move |_, query| match query[0].as_u64() {
        Some(1) => StubReply::Json(json!({"t": 3, "r": [1, 2]})),
        Some(3) => {
            *record.lock().unwrap() += 1;
            StubReply::Silent
        }
        _ => StubReply::Silent,
    })
    .await;

    let conn = connect(addr).await;
    let first = conn
        .run_with(json!("abc"), RunOptions::new(), |result| match result {
            RunResult::Cursor(_) => "cursor",
            _ => "other",
        })
        .await
        .unwrap();
    assert_eq!(first, "cursor");
    assert!(
        wait_until(|| *stops.lock().unwrap() == 1, Duration::from_secs(1)).await,
        "scoped cleanup did not stop the cursor"
    );
}
