//! End-to-end handshake tests against an in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use pylon_common::ClientConfig;
use pylon_gateway::{ConnectionState, GatewayConnection};
use pylon_http::{RateLimiter, SessionStartLimit};

fn test_config(zlib_stream: bool) -> ClientConfig {
    let mut config = ClientConfig::new("test-token");
    config.gateway.zlib_stream = zlib_stream;
    config
}

fn build_connection(addr: std::net::SocketAddr, zlib_stream: bool) -> Arc<GatewayConnection> {
    let session_start = SessionStartLimit {
        total: 1000,
        remaining: 1000,
        reset_after: 0,
    };
    GatewayConnection::new(
        &test_config(zlib_stream),
        &format!("ws://{addr}"),
        session_start,
        Arc::new(RateLimiter::new()),
    )
}

/// Compresses one payload on a shared deflate stream, flushed with a sync
/// marker the way transport-compressed gateways frame their messages.
fn stream_compress(compressor: &mut Compress, payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);
    compressor
        .compress_vec(payload.as_bytes(), &mut out, FlushCompress::Sync)
        .unwrap();
    assert!(out.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    out
}

/// Reads text frames until one arrives, skipping everything else.
async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.expect("connection ended").unwrap() {
            Message::Text(text) => return text,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_identify_handshake_and_event_dispatch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // A long interval keeps heartbeats out of this exchange
        ws.send(Message::Text(
            r#"{"op":10,"d":{"heartbeat_interval":60000,"_trace":[]}}"#.to_string(),
        ))
        .await
        .unwrap();

        let identify: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "test-token");
        assert_eq!(identify["d"]["shard"], serde_json::json!([0, 1]));

        ws.send(Message::Text(
            r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"sess-1","user":{"id":"42"}}}"#
                .to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            r#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{"content":"hi"}}"#.to_string(),
        ))
        .await
        .unwrap();

        // Wait for the client's close frame before dropping the socket
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    });

    let connection = build_connection(addr, false);
    let events = connection.events();

    let connect_task = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.connect().await })
    };

    let payload = events
        .wait_for("message_create", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(payload["content"], "hi");

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.session_id(), Some("sess-1".to_string()));
    assert_eq!(connection.sequence(), Some(2));

    connection.close().await;
    connect_task.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn test_stream_compressed_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // One compressor for the whole connection, like a real
        // transport-compressed gateway
        let mut compressor = Compress::new(Compression::default(), true);

        ws.send(Message::Binary(stream_compress(
            &mut compressor,
            r#"{"op":10,"d":{"heartbeat_interval":60000,"_trace":[]}}"#,
        )))
        .await
        .unwrap();

        let identify: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(identify["op"], 2);
        // Payload compression is always offered; it is independent of the
        // transport-level zlib stream
        assert_eq!(identify["d"]["compress"], true);

        ws.send(Message::Binary(stream_compress(
            &mut compressor,
            r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"sess-2"}}"#,
        )))
        .await
        .unwrap();

        // Split one logical message across two WebSocket frames; the sync
        // marker only terminates the second one
        let compressed = stream_compress(
            &mut compressor,
            r#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{"content":"compressed"}}"#,
        );
        let mid = compressed.len() / 2;
        ws.send(Message::Binary(compressed[..mid].to_vec())).await.unwrap();
        ws.send(Message::Binary(compressed[mid..].to_vec())).await.unwrap();

        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    });

    let connection = build_connection(addr, true);
    let events = connection.events();

    let connect_task = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.connect().await })
    };

    let payload = events
        .wait_for("message_create", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(payload["content"], "compressed");
    assert_eq!(connection.session_id(), Some("sess-2".to_string()));

    connection.close().await;
    connect_task.await.unwrap().unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_heartbeat_request_is_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        ws.send(Message::Text(
            r#"{"op":10,"d":{"heartbeat_interval":60000,"_trace":[]}}"#.to_string(),
        ))
        .await
        .unwrap();

        // Consume the identify
        let identify: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(identify["op"], 2);

        ws.send(Message::Text(
            r#"{"op":0,"t":"READY","s":7,"d":{"session_id":"sess-3"}}"#.to_string(),
        ))
        .await
        .unwrap();

        // Ask for a heartbeat out of band
        ws.send(Message::Text(r#"{"op":1,"d":null}"#.to_string()))
            .await
            .unwrap();

        // The periodic heartbeat sent right after hello carries a null
        // sequence; the answer to the request carries the ready sequence
        loop {
            let frame: serde_json::Value =
                serde_json::from_str(&next_text(&mut ws).await).unwrap();
            assert_eq!(frame["op"], 1);
            if frame["d"] == 7 {
                break;
            }
        }

        ws.send(Message::Text(r#"{"op":11}"#.to_string())).await.unwrap();

        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    });

    let connection = build_connection(addr, false);
    let events = connection.events();

    let connect_task = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.connect().await })
    };

    events.wait_for("ready", Duration::from_secs(5)).await.unwrap();

    // Give the out-of-band heartbeat exchange time to complete
    tokio::time::sleep(Duration::from_millis(200)).await;

    connection.close().await;
    connect_task.await.unwrap().unwrap();
    server.await.unwrap();
}
