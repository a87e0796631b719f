//! Tests for stream-local and session-fatal failures

use flip_net::{
    rst_status, FlipError, FlipFrame, FlipSessionPool, FlipTransaction, RequestInfo,
    SessionConfig,
};

use super::support::*;

fn new_pool(compression: bool) -> (FlipSessionPool, PeerListener) {
    let (connector, listener) = mock_connector(compression);
    let config = SessionConfig::default().with_compression(compression);
    (FlipSessionPool::new(config, connector).unwrap(), listener)
}

#[tokio::test]
async fn test_data_before_reply_fails_only_that_stream() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.read_frame().await;
        peer.send_data(1, b"too early", false).await;
        peer.send_reply(3, OK_REPLY, false).await;
        peer.send_data(3, b"fine", true).await;
        peer
    });

    let mut broken = FlipTransaction::new(&pool);
    let mut healthy = FlipTransaction::new(&pool);
    let broken_request = RequestInfo::get(uri("http://www.google.com/broken"));
    let healthy_request = RequestInfo::get(uri("http://www.google.com/healthy"));
    let (a, b) = tokio::join!(broken.start(&broken_request), healthy.start(&healthy_request));

    assert!(matches!(a, Err(FlipError::SynReplyNotReceived(1))));
    b.unwrap();
    assert_eq!(&healthy.read_to_end().await.unwrap()[..], b"fine");
    assert!(!pool.get(&google()).is_closed());
    server.await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_closes_session() {
    init_tracing();
    let (pool, mut listener) = new_pool(false);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_raw().await;
        peer.write(&[
            0x80, 0x02, 0x00, 0x03, // version 2
            0x00, 0x00, 0x00, 0x08,
            0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
        ])
        .await;
        // The session tears down the connection.
        assert!(peer.read_to_eof().await.is_empty());
    });

    let mut trans = FlipTransaction::new(&pool);
    let err = trans
        .start(&RequestInfo::get(uri("http://www.google.com/")))
        .await
        .unwrap_err();
    assert!(matches!(err, FlipError::Protocol(ref m) if m.contains("version 2")), "Error: {}", err);
    assert!(err.is_session_fatal());
    assert!(!pool.has_session(&google()));
    server.await.unwrap();
}

#[tokio::test]
async fn test_corrupt_header_block_closes_session() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.write(&[
            0x80, 0x01, 0x00, 0x02,
            0x00, 0x00, 0x00, 0x0a,
            0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, // unused
            0xde, 0xad, 0xbe, 0xef,
        ])
        .await;
        peer
    });

    let mut trans = FlipTransaction::new(&pool);
    let err = trans
        .start(&RequestInfo::get(uri("http://www.google.com/")))
        .await
        .unwrap_err();
    assert!(matches!(err, FlipError::Compression(_)), "Error: {}", err);
    assert!(!pool.has_session(&google()));
    server.await.unwrap();
}

#[tokio::test]
async fn test_oversized_data_frame_closes_session() {
    init_tracing();
    let (connector, mut listener) = mock_connector(true);
    let mut config = SessionConfig::default();
    config.max_frame_length = 4;
    let pool = FlipSessionPool::new(config, connector).unwrap();

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_data(1, b"way too long", true).await;
        peer
    });

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/"))).await.unwrap();
    let err = trans.read_to_end().await.unwrap_err();
    assert!(matches!(err, FlipError::Protocol(ref m) if m.contains("too large")), "Error: {}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn test_frames_for_unknown_streams_are_ignored() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.send_data(7, b"stray", true).await;
        peer.send_rst(9, rst_status::CANCEL).await;
        peer.send_reply(11, OK_REPLY, true).await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_data(1, b"ok", true).await;
        peer
    });

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/"))).await.unwrap();
    assert_eq!(&trans.read_to_end().await.unwrap()[..], b"ok");
    assert!(!pool.get(&google()).is_closed());
    server.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_request_sends_cancel() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        assert!(matches!(peer.read_frame().await, FlipFrame::SynStream { stream_id: 1, .. }));
        match peer.read_frame().await {
            FlipFrame::RstStream { stream_id, status } => {
                assert_eq!(stream_id, 1);
                assert_eq!(status, rst_status::CANCEL);
            }
            other => panic!("Expected RstStream, got {:?}", other),
        }
        assert!(matches!(peer.read_frame().await, FlipFrame::SynStream { stream_id: 3, .. }));
        peer.send_reply(3, OK_REPLY, false).await;
        peer.send_data(3, b"second", true).await;
        peer
    });

    let mut abandoned = FlipTransaction::new(&pool);
    abandon(abandoned.start(&RequestInfo::get(uri("http://www.google.com/slow")))).await;

    let session = pool.get(&google());
    assert_eq!(session.stats().streams_abandoned, 1);
    assert_eq!(session.active_stream_count(), 0);
    assert!(!session.is_stream_active(1));

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/fast"))).await.unwrap();
    assert_eq!(trans.stream_id(), Some(3));
    assert_eq!(&trans.read_to_end().await.unwrap()[..], b"second");
    server.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_reply_resets_stream() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_reply(1, OK_REPLY, false).await;
        match peer.read_frame().await {
            FlipFrame::RstStream { stream_id, status } => {
                assert_eq!(stream_id, 1);
                assert_eq!(status, rst_status::PROTOCOL_ERROR);
            }
            other => panic!("Expected RstStream, got {:?}", other),
        }
        peer
    });

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/"))).await.unwrap();
    let err = trans.read_to_end().await.unwrap_err();
    assert!(matches!(err, FlipError::Protocol(_)), "Error: {}", err);
    // Only the stream failed.
    assert!(!pool.get(&google()).is_closed());
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_lost_mid_body() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_data(1, b"half", false).await;
    });

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/"))).await.unwrap();
    let mut buf = [0u8; 16];
    let n = trans.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"half");
    let err = trans.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, FlipError::ConnectionClosed), "Error: {}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_stream_with_client_id_is_dropped() {
    init_tracing();
    let (pool, mut listener) = new_pool(true);

    let server = tokio::spawn(async move {
        let mut peer = listener.accept().await;
        peer.read_frame().await;
        peer.send_push(5, &[("path", "/odd.js"), ("status", "200"), ("version", "HTTP/1.1")], true)
            .await;
        peer.send_reply(1, OK_REPLY, false).await;
        peer.send_data(1, b"ok", true).await;
        peer
    });

    let mut trans = FlipTransaction::new(&pool);
    trans.start(&RequestInfo::get(uri("http://www.google.com/"))).await.unwrap();
    assert_eq!(&trans.read_to_end().await.unwrap()[..], b"ok");

    let session = pool.get(&google());
    assert_eq!(session.stats().streams_pushed, 0);
    assert_eq!(session.stream_state(5), None);
    server.await.unwrap();
}
