//! End-to-end WebRTC dialing against an in-process signaling server and an
//! echoing answer peer

mod harness;

use bytes::Bytes;
use harness::{
    start_server, ServerOptions, ECHO_METHOD, FAIL_METHOD, HANG_METHOD, HOST, SECRET,
};
use remotemedia_webrtc_rpc::channels::ChannelState;
use remotemedia_webrtc_rpc::generated::proto::rpc::webrtc::v1::WebRtcConfig;
use remotemedia_webrtc_rpc::{
    Credentials, DialOptions, Dialer, Error, WebRtcDialOptions, MAX_PACKET_PAYLOAD,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::Code;

/// Loopback-only negotiation: no STUN servers
fn options(disable_trickle_ice: bool) -> DialOptions {
    DialOptions::default()
        .with_dial_timeout(Duration::from_secs(15))
        .with_webrtc(WebRtcDialOptions {
            signaling_insecure: true,
            disable_trickle_ice,
            ice_servers: Some(Vec::new()),
            ..Default::default()
        })
}

#[tokio::test]
async fn test_trickle_dial_and_unary_echo() {
    harness::init_tracing();
    let server = start_server(ServerOptions::default()).await;

    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Open);

    let reply = channel
        .unary(ECHO_METHOD, Bytes::from_static(b"hello"), None)
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));
    assert_eq!(channel.active_streams(), 0);

    let calls = server.state.call_requests.lock().clone();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].disable_trickle);

    // Gathering may finish after the channel opens
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.state.done_updates() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("done update sent");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.state.done_updates(), 1);

    channel.close().await;
}

#[tokio::test]
async fn test_non_trickle_dial_sends_no_updates() {
    harness::init_tracing();
    let server = start_server(ServerOptions::default()).await;

    let channel = Dialer::new(options(true))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let reply = channel
        .unary(ECHO_METHOD, Bytes::from_static(b"full offer"), None)
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"full offer"));

    let calls = server.state.call_requests.lock().clone();
    assert!(calls[0].disable_trickle);
    assert!(server.state.updates().is_empty());

    channel.close().await;
}

#[tokio::test]
async fn test_server_config_can_disable_trickle() {
    let server = start_server(ServerOptions {
        require_auth: false,
        webrtc_config: Some(WebRtcConfig {
            additional_ice_servers: Vec::new(),
            disable_trickle: true,
        }),
        ..Default::default()
    })
    .await;

    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    assert!(server.state.call_requests.lock()[0].disable_trickle);
    assert!(server.state.updates().is_empty());
    channel.close().await;
}

#[tokio::test]
async fn test_authenticated_signaling() {
    let server = start_server(ServerOptions {
        require_auth: true,
        webrtc_config: None,
        ..Default::default()
    })
    .await;

    let options = options(false).with_credentials(Credentials::new("api-key", SECRET));
    let channel = Dialer::new(options)
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    assert_eq!(server.state.authenticate_calls(), 1);
    channel.close().await;
}

#[tokio::test]
async fn test_large_messages_are_fragmented_both_ways() {
    let server = start_server(ServerOptions::default()).await;
    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..MAX_PACKET_PAYLOAD * 3 + 17)
        .map(|i| (i % 251) as u8)
        .collect();
    let reply = channel
        .unary(ECHO_METHOD, Bytes::from(payload.clone()), None)
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), payload.as_slice());

    channel.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_multiplexed() {
    let server = start_server(ServerOptions::default()).await;
    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let calls = (0..8u8).map(|i| {
        let channel = channel.clone();
        tokio::spawn(async move {
            let reply = channel
                .unary(ECHO_METHOD, Bytes::from(vec![i; 64]), None)
                .await
                .unwrap();
            assert_eq!(reply.as_ref(), vec![i; 64].as_slice());
        })
    });
    for call in futures::future::join_all(calls).await {
        call.unwrap();
    }

    channel.close().await;
}

#[tokio::test]
async fn test_error_status_surfaces() {
    let server = start_server(ServerOptions::default()).await;
    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let err = channel
        .unary(FAIL_METHOD, Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    match err {
        Error::RpcStatus(status) => {
            assert_eq!(status.code(), Code::NotFound);
            assert_eq!(status.message(), "no such thing");
        }
        other => panic!("expected RpcStatus, got {:?}", other),
    }

    // The channel stays usable
    let reply = channel
        .unary(ECHO_METHOD, Bytes::from_static(b"still here"), None)
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"still here"));

    channel.close().await;
}

#[tokio::test]
async fn test_deadline_resets_remote_stream() {
    let server = start_server(ServerOptions::default()).await;
    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let err = channel
        .unary(
            HANG_METHOD,
            Bytes::from_static(b"x"),
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(_)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.state.resets.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server saw the stream reset");

    channel.close().await;
}

#[tokio::test]
async fn test_close_fails_outstanding_calls() {
    let server = start_server(ServerOptions::default()).await;
    let channel = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap();

    let mut call = channel
        .new_call(HANG_METHOD, &MetadataMap::new(), None)
        .await
        .unwrap();
    call.send_message(Bytes::from_static(b"x")).await.unwrap();
    call.response_headers().await.unwrap();

    channel.close().await;

    assert!(matches!(call.message().await, Err(Error::Cancelled(_))));
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel
        .unary(ECHO_METHOD, Bytes::new(), None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_rejected_signaling_fails_dial() {
    let server = start_server(ServerOptions::default()).await;

    // The host routing check rejects every signaling call for another host
    let err = Dialer::new(options(false))
        .dial_webrtc(&server.address, "nobody.local")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Signaling(_)));
    assert!(server.state.call_requests.lock().is_empty());
}

#[tokio::test]
async fn test_config_failure_fails_dial_before_call() {
    let server = start_server(ServerOptions {
        config_error: Some(Code::PermissionDenied),
        ..Default::default()
    })
    .await;

    let err = Dialer::new(options(false))
        .dial_webrtc(&server.address, HOST)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Signaling(_)));
    assert_eq!(server.state.config_calls.load(Ordering::SeqCst), 1);
    assert!(server.state.call_requests.lock().is_empty());
}

#[tokio::test]
async fn test_dial_timeout_covers_unresponsive_signaling() {
    let server = start_server(ServerOptions {
        stall_config: true,
        ..Default::default()
    })
    .await;

    let options = options(false).with_dial_timeout(Duration::from_millis(500));
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        Dialer::new(options).dial_webrtc(&server.address, HOST),
    )
    .await
    .expect("dial gives up within its timeout")
    .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(server.state.call_requests.lock().is_empty());
}
