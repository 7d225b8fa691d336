//! # Bidirectional Streams
//!
//! Ping-pong sessions between a client and whichever server accepted the
//! stream, plus close propagation in both directions.

#[cfg(test)]
mod tests {
    use super::super::fixtures::{bus, client, server, MODES};
    use busrpc::{
        ErrorCode, HandlerOptions, MethodPolicy, RequestOptions, RpcError, RpcInfo, RpcServer,
        RpcStream, DEFAULT_CLIENT_TIMEOUT,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frame {
        code: String,
    }

    impl Frame {
        fn new(code: &str) -> Self {
            Self { code: code.into() }
        }
    }

    /// Answers every PING with a PONG; notifies `ended` when the inbound
    /// sequence ends.
    async fn register_ping_pong(server: &RpcServer, ended: Arc<Notify>) {
        server
            .register_stream_handler(
                "ping_pong",
                move |_info: RpcInfo, mut stream: RpcStream<Frame, Frame>| {
                    let ended = ended.clone();
                    async move {
                        while let Some(frame) = stream.recv().await {
                            if frame.code == "PING" {
                                stream.send(&Frame::new("PONG")).await?;
                            }
                        }
                        ended.notify_one();
                        Ok(())
                    }
                },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_pong_and_close_propagation() {
        let policies = [
            MethodPolicy::unicast().with_queue(),
            MethodPolicy::unicast().with_claim(),
        ];
        for mode in MODES {
            for policy in policies {
                let bus = bus(mode);
                let ended = Arc::new(Notify::new());
                let servers = [
                    server(&bus, "ping_pong", policy),
                    server(&bus, "ping_pong", policy),
                ];
                for s in &servers {
                    register_ping_pong(s, ended.clone()).await;
                }
                let client = client(&bus, "ping_pong", policy);

                let mut stream = client
                    .open_stream::<Frame, Frame>("ping_pong", RequestOptions::default())
                    .await
                    .unwrap();
                assert!(servers.iter().any(|s| s.server_id() == stream.peer_id()));

                for _ in 0..3 {
                    stream.send(&Frame::new("PING")).await.unwrap();
                    let reply = timeout(DEFAULT_CLIENT_TIMEOUT, stream.recv())
                        .await
                        .unwrap()
                        .unwrap();
                    assert_eq!(reply.code, "PONG", "mode {mode:?} policy {policy:?}");
                }

                stream.close(None).await.unwrap();
                timeout(DEFAULT_CLIENT_TIMEOUT, ended.notified())
                    .await
                    .unwrap();
                assert!(stream.is_closed());
            }
        }
    }

    #[tokio::test]
    async fn test_server_error_closes_client_side() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Structured);
        let server = server(&bus, "ping_pong", policy);
        server
            .register_stream_handler(
                "ping_pong",
                |_info: RpcInfo, mut stream: RpcStream<Frame, Frame>| async move {
                    stream.recv().await;
                    Err(RpcError::internal("done"))
                },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
        let client = client(&bus, "ping_pong", policy);

        let mut stream = client
            .open_stream::<Frame, Frame>("ping_pong", RequestOptions::default())
            .await
            .unwrap();
        stream.send(&Frame::new("PING")).await.unwrap();

        let next = timeout(DEFAULT_CLIENT_TIMEOUT, stream.recv()).await.unwrap();
        assert!(next.is_none());
        let err = stream.err().unwrap();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.message(), "done");

        let err = stream.send(&Frame::new("PING")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Canceled);
    }

    #[tokio::test]
    async fn test_caller_cancel_closes_both_sides() {
        let policy = MethodPolicy::unicast().with_queue();
        for mode in MODES {
            let bus = bus(mode);
            let ended = Arc::new(Notify::new());
            let server = server(&bus, "ping_pong", policy);
            register_ping_pong(&server, ended.clone()).await;
            let client = client(&bus, "ping_pong", policy);

            let cancel = CancellationToken::new();
            let mut stream = client
                .open_stream::<Frame, Frame>(
                    "ping_pong",
                    RequestOptions::default().with_cancel(cancel.clone()),
                )
                .await
                .unwrap();
            stream.send(&Frame::new("PING")).await.unwrap();
            let reply = timeout(DEFAULT_CLIENT_TIMEOUT, stream.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply.code, "PONG");

            cancel.cancel();
            timeout(DEFAULT_CLIENT_TIMEOUT, ended.notified())
                .await
                .unwrap();
            let next = timeout(DEFAULT_CLIENT_TIMEOUT, stream.recv()).await.unwrap();
            assert!(next.is_none(), "mode {mode:?}");
            assert!(stream.is_closed());
            assert_eq!(stream.err().unwrap().code(), ErrorCode::Canceled);
        }
    }

    #[tokio::test]
    async fn test_panicking_stream_handler_closes_with_internal() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let server = server(&bus, "ping_pong", policy);
        server
            .register_stream_handler(
                "ping_pong",
                |_info: RpcInfo, mut stream: RpcStream<Frame, Frame>| async move {
                    if stream.recv().await.is_some() {
                        panic!("boom");
                    }
                    Ok(())
                },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
        let client = client(&bus, "ping_pong", policy);

        let mut stream = client
            .open_stream::<Frame, Frame>("ping_pong", RequestOptions::default())
            .await
            .unwrap();
        stream.send(&Frame::new("PING")).await.unwrap();

        let next = timeout(DEFAULT_CLIENT_TIMEOUT, stream.recv()).await.unwrap();
        assert!(next.is_none());
        let err = stream.err().unwrap();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.message().contains("boom"));
    }

    #[tokio::test]
    async fn test_frames_keep_send_order() {
        let policy = MethodPolicy::unicast().with_queue();
        for mode in MODES {
            let bus = bus(mode);
            let server = server(&bus, "echo", policy);
            server
                .register_stream_handler(
                    "echo",
                    |_info: RpcInfo, mut stream: RpcStream<u32, u32>| async move {
                        while let Some(n) = stream.recv().await {
                            stream.send(&n).await?;
                        }
                        Ok(())
                    },
                    HandlerOptions::default(),
                )
                .await
                .unwrap();
            let client = client(&bus, "echo", policy);

            let mut stream = client
                .open_stream::<u32, u32>("echo", RequestOptions::default())
                .await
                .unwrap();
            for n in 0..20 {
                stream.send(&n).await.unwrap();
            }
            for n in 0..20 {
                assert_eq!(stream.recv().await, Some(n));
            }
            stream.close(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stream_requires_single_delivery() {
        let bus = bus(busrpc::RoutingMode::Legacy);
        for policy in [MethodPolicy::unicast(), MethodPolicy::broadcast()] {
            let client = client(&bus, "ping_pong", policy);
            let err = client
                .open_stream::<Frame, Frame>("ping_pong", RequestOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{policy:?}");
        }
    }

    #[tokio::test]
    async fn test_open_without_server_times_out() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let client = client(&bus, "ping_pong", policy);

        let err = client
            .open_stream::<Frame, Frame>(
                "ping_pong",
                RequestOptions::default().with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_unary_handler_rejects_stream_open() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let server = server(&bus, "add_one", policy);
        server
            .register_handler(
                "add_one",
                |_info: RpcInfo, n: u64| async move { Ok(n + 1) },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
        let client = client(&bus, "add_one", policy);

        let err = client
            .open_stream::<u64, u64>("add_one", RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
