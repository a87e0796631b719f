//! Tests for FlipSessionPool: reuse, removal and shutdown

use std::sync::Arc;

use flip_net::{
    Endpoint, FlipError, FlipFrame, FlipSessionPool, FlipTransaction, RequestInfo, SessionConfig,
    StreamEvent,
};

use super::support::*;

#[tokio::test]
async fn test_sequential_requests_share_a_session() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector.clone()).unwrap();

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        for expected in [1, 3] {
            match peer.read_frame().await {
                FlipFrame::SynStream { stream_id, .. } => assert_eq!(stream_id, expected),
                other => panic!("Expected SynStream, got {:?}", other),
            }
            peer.send_reply(expected, OK_REPLY, false).await;
            peer.send_data(expected, b"body", true).await;
        }
        peer
    });

    let mut ids = Vec::new();
    for path in ["http://www.google.com/a", "http://www.google.com/b"] {
        let mut trans = FlipTransaction::new(&pool);
        trans.start(&RequestInfo::get(uri(path))).await.unwrap();
        ids.push(trans.stream_id());
        assert_eq!(&trans.read_to_end().await.unwrap()[..], b"body");
    }

    assert_eq!(ids, [Some(1), Some(3)]);
    assert_eq!(connector.connects(), 1);
    assert_eq!(pool.len(), 1);

    let session = pool.get(&google());
    assert!(Arc::ptr_eq(&session, &pool.get(&google())));
    assert_eq!(session.stats().streams_initiated, 2);
    assert_eq!(session.active_stream_count(), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_multiplex() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector.clone()).unwrap();

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        let mut ids = Vec::new();
        for _ in 0..2 {
            match peer.read_frame().await {
                FlipFrame::SynStream { stream_id, .. } => ids.push(stream_id),
                other => panic!("Expected SynStream, got {:?}", other),
            }
        }
        assert_eq!(ids, [1, 3]);
        // Answer out of order, interleaving the bodies.
        peer.send_reply(3, OK_REPLY, false).await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_data(3, b"three", false).await;
        peer.send_data(1, b"one", true).await;
        peer.send_data(3, b"!", true).await;
        peer
    });

    let mut first = FlipTransaction::new(&pool);
    let mut second = FlipTransaction::new(&pool);
    let first_request = RequestInfo::get(uri("http://www.google.com/1"));
    let second_request = RequestInfo::get(uri("http://www.google.com/3"));
    let (a, b) = tokio::join!(first.start(&first_request), second.start(&second_request));
    a.unwrap();
    b.unwrap();

    let (a, b) = tokio::join!(first.read_to_end(), second.read_to_end());
    assert_eq!(&a.unwrap()[..], b"one");
    assert_eq!(&b.unwrap()[..], b"three!");
    assert_eq!(connector.connects(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn test_session_leaves_pool_when_connection_drops() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector.clone()).unwrap();

    let session = pool.get(&google());
    let peer = listener.accept().await;
    wait_until(|| session.is_connected()).await;
    assert!(pool.has_session(&google()));

    drop(peer);
    wait_until(|| session.is_closed()).await;
    assert!(!session.is_connected());
    assert!(!pool.has_session(&google()));

    // The next request gets a fresh connection.
    let replacement = pool.get(&google());
    assert!(!Arc::ptr_eq(&session, &replacement));
    let _peer = listener.accept().await;
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_without_keep_alive_idle_sessions_are_dropped() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let config = SessionConfig::default().with_keep_alive(false);
    let pool = FlipSessionPool::new(config, connector).unwrap();

    let session = pool.get(&google());
    let mut peer = listener.accept().await;
    assert!(pool.has_session(&google()));

    drop(session);
    assert!(!pool.has_session(&google()));
    assert!(pool.is_empty());
    // Dropping the last reference closes the connection.
    assert!(peer.read_to_eof().await.is_empty());
}

#[tokio::test]
async fn test_keep_alive_holds_idle_sessions() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector).unwrap();

    drop(pool.get(&google()));
    let _peer = listener.accept().await;
    assert!(pool.has_session(&google()));
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_remove_detaches_without_closing() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector.clone()).unwrap();

    let session = pool.get(&google());
    let _peer = listener.accept().await;

    let removed = pool.remove(&google()).unwrap();
    assert!(Arc::ptr_eq(&session, &removed));
    assert!(!removed.is_closed());
    assert!(!pool.has_session(&google()));
    assert!(pool.remove(&google()).is_none());

    let fresh = pool.get(&google());
    assert!(!Arc::ptr_eq(&session, &fresh));
    let _second_peer = listener.accept().await;
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_close_all_sessions() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let pool = FlipSessionPool::new(SessionConfig::default(), connector).unwrap();

    let google_session = pool.get(&google());
    let mut google_peer = listener.accept().await;
    let other_session = pool.get(&Endpoint::new("www.example.com", 80));
    let mut other_peer = listener.accept().await;
    assert_eq!(pool.len(), 2);

    let mut pending = google_session
        .create_stream(&RequestInfo::get(uri("http://www.google.com/slow")))
        .unwrap();
    google_peer.read_frame().await;

    pool.close_all_sessions();
    assert!(pool.is_empty());
    assert!(google_session.is_closed());
    assert!(other_session.is_closed());

    match pending.next_event().await {
        Some(StreamEvent::Failed(FlipError::ConnectionClosed)) => {}
        other => panic!("Expected ConnectionClosed, got {:?}", other),
    }
    assert!(pending.next_event().await.is_none());
    assert!(google_peer.read_to_eof().await.is_empty());
    assert!(other_peer.read_to_eof().await.is_empty());

    // A closed session refuses new streams.
    let err = google_session
        .create_stream(&RequestInfo::get(uri("http://www.google.com/")))
        .unwrap_err();
    assert!(matches!(err, FlipError::ConnectionClosed));
}

#[tokio::test]
async fn test_connect_failure_fails_request() {
    init_tracing();
    let pool = FlipSessionPool::new(SessionConfig::default(), RefusingConnector).unwrap();

    let mut trans = FlipTransaction::new(&pool);
    let err = trans
        .start(&RequestInfo::get(uri("http://www.google.com/")))
        .await
        .unwrap_err();
    assert!(matches!(err, FlipError::Connect(_)), "Error: {}", err);
    assert!(!pool.has_session(&google()));
}
