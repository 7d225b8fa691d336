//! # RPC Flows
//!
//! Client/server calls over the in-process bus:
//!
//! 1. **Unicast**: queue dispatch runs the handler once per call
//! 2. **Broadcast**: every server answers, errors included
//! 3. **Topics**: scoped handlers only see calls for their topic
//! 4. **Lifecycle**: deregistration, draining close, validation failures

#[cfg(test)]
mod tests {
    use super::super::fixtures::{bus, client, server, MODES, SERVICE};
    use busrpc::{
        ErrorCode, HandlerOptions, MethodPolicy, RequestOptions, RpcClient, RpcError, RpcInfo,
        ServiceDefinition, Topic,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Request ids seen by a handler, one entry per invocation.
    type Calls = Arc<Mutex<Vec<String>>>;

    /// Handler answering `(request_id, n + 1)` and recording each invocation.
    async fn register_add_one(
        server: &busrpc::RpcServer,
        method: &str,
        calls: Calls,
        topic: Topic,
    ) {
        server
            .register_handler(
                method,
                move |info: RpcInfo, n: u64| {
                    let calls = calls.clone();
                    async move {
                        calls.lock().push(info.request_id.clone());
                        Ok((info.request_id, n + 1))
                    }
                },
                HandlerOptions::default().with_topic(topic),
            )
            .await
            .unwrap();
    }

    fn short() -> RequestOptions {
        RequestOptions::default().with_timeout(Duration::from_millis(300))
    }

    // =============================================================================
    // UNICAST
    // =============================================================================

    #[tokio::test]
    async fn test_queue_unicast_runs_one_handler() {
        let policy = MethodPolicy::unicast().with_queue();
        for mode in MODES {
            let bus = bus(mode);
            let calls = Arc::new(Mutex::new(Vec::new()));
            let servers = [
                server(&bus, "add_one", policy),
                server(&bus, "add_one", policy),
            ];
            for s in &servers {
                register_add_one(s, "add_one", calls.clone(), Topic::none()).await;
            }
            let client = client(&bus, "add_one", policy);

            let (request_id, sum): (String, u64) = client
                .request_single("add_one", &1u64, RequestOptions::default())
                .await
                .unwrap();

            assert_eq!(sum, 2);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(*calls.lock(), vec![request_id], "mode {mode:?}");
        }
    }

    #[tokio::test]
    async fn test_queue_unicast_many_calls() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let servers = [
            server(&bus, "add_one", policy),
            server(&bus, "add_one", policy),
            server(&bus, "add_one", policy),
        ];
        for s in &servers {
            register_add_one(s, "add_one", calls.clone(), Topic::none()).await;
        }
        let client = client(&bus, "add_one", policy);

        const CALLS: u64 = 20;
        let results = futures::future::join_all((0..CALLS).map(|n| {
            let client = client.clone();
            async move {
                client
                    .request_single::<u64, (String, u64)>("add_one", &n, RequestOptions::default())
                    .await
            }
        }))
        .await;

        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap().1, n as u64 + 1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.lock().len(), CALLS as usize);
    }

    #[tokio::test]
    async fn test_fanout_unicast_first_reply_wins() {
        let policy = MethodPolicy::unicast();
        let bus = bus(busrpc::RoutingMode::Structured);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let servers = [
            server(&bus, "add_one", policy),
            server(&bus, "add_one", policy),
        ];
        for s in &servers {
            register_add_one(s, "add_one", calls.clone(), Topic::none()).await;
        }
        let client = client(&bus, "add_one", policy);

        let (_, sum): (String, u64) = client
            .request_single("add_one", &41u64, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(sum, 42);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let server = server(&bus, "fail", policy);
        server
            .register_handler(
                "fail",
                |_info: RpcInfo, _n: u64| async move { Err::<u64, _>(RpcError::internal("foo")) },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
        let client = client(&bus, "fail", policy);

        let err = client
            .request_single::<u64, u64>("fail", &1, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.message(), "foo");
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_internal() {
        let policy = MethodPolicy::unicast().with_queue();
        for mode in MODES {
            let bus = bus(mode);
            let server = server(&bus, "add_one", policy);
            server
                .register_handler(
                    "add_one",
                    |_info: RpcInfo, n: u64| async move {
                        if n == 1 {
                            panic!("boom");
                        }
                        Ok::<u64, RpcError>(n + 1)
                    },
                    HandlerOptions::default(),
                )
                .await
                .unwrap();
            let client = client(&bus, "add_one", policy);

            let started = std::time::Instant::now();
            let err = client
                .request_single::<u64, u64>("add_one", &1, RequestOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::Internal, "mode {mode:?}");
            assert!(err.message().contains("boom"));
            assert!(started.elapsed() < Duration::from_secs(1));

            // The server keeps serving after the panic.
            let sum: u64 = client
                .request_single("add_one", &2u64, RequestOptions::default())
                .await
                .unwrap();
            assert_eq!(sum, 3);
        }
    }

    // =============================================================================
    // BROADCAST
    // =============================================================================

    #[tokio::test]
    async fn test_broadcast_collects_every_server() {
        let policy = MethodPolicy::broadcast();
        for mode in MODES {
            let bus = bus(mode);
            let calls = Arc::new(Mutex::new(Vec::new()));
            let servers = [
                server(&bus, "add_one_multi", policy),
                server(&bus, "add_one_multi", policy),
                server(&bus, "add_one_multi", policy),
            ];
            register_add_one(&servers[0], "add_one_multi", calls.clone(), Topic::none()).await;
            register_add_one(&servers[1], "add_one_multi", calls.clone(), Topic::none()).await;
            servers[2]
                .register_handler(
                    "add_one_multi",
                    |_info: RpcInfo, _n: u64| async move {
                        Err::<(String, u64), _>(RpcError::internal("foo"))
                    },
                    HandlerOptions::default(),
                )
                .await
                .unwrap();
            let client = client(&bus, "add_one_multi", policy);

            let mut responses = client
                .request_multi::<u64, (String, u64)>("add_one_multi", &1, RequestOptions::default())
                .await
                .unwrap();
            let request_id = responses.request_id().to_string();

            let mut successes = 0;
            let mut errors = Vec::new();
            while let Some(response) = responses.recv().await {
                match response.result {
                    Ok((id, sum)) => {
                        assert_eq!(id, request_id);
                        assert_eq!(sum, 2);
                        successes += 1;
                    }
                    Err(e) => errors.push(e),
                }
            }

            assert_eq!(successes, 2, "mode {mode:?}");
            assert_eq!(errors, vec![RpcError::internal("foo")]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_responses_name_their_server() {
        let policy = MethodPolicy::broadcast();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let servers = [
            server(&bus, "add_one_multi", policy),
            server(&bus, "add_one_multi", policy),
        ];
        for s in &servers {
            register_add_one(s, "add_one_multi", calls.clone(), Topic::none()).await;
        }
        let client = client(&bus, "add_one_multi", policy);

        let mut responses = client
            .request_multi::<u64, (String, u64)>("add_one_multi", &1, RequestOptions::default())
            .await
            .unwrap();
        let mut responders = Vec::new();
        while let Some(response) = responses.recv().await {
            responders.push(response.server_id);
        }
        responders.sort();

        let mut expected: Vec<String> = servers.iter().map(|s| s.server_id().to_string()).collect();
        expected.sort();
        assert_eq!(responders, expected);
    }

    #[tokio::test]
    async fn test_broadcast_reports_panicking_server() {
        let policy = MethodPolicy::broadcast();
        let bus = bus(busrpc::RoutingMode::Structured);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let healthy = server(&bus, "add_one_multi", policy);
        let broken = server(&bus, "add_one_multi", policy);
        register_add_one(&healthy, "add_one_multi", calls.clone(), Topic::none()).await;
        broken
            .register_handler(
                "add_one_multi",
                |info: RpcInfo, n: u64| async move {
                    if n == 1 {
                        panic!("boom");
                    }
                    Ok::<_, RpcError>((info.request_id, n + 1))
                },
                HandlerOptions::default(),
            )
            .await
            .unwrap();
        let client = client(&bus, "add_one_multi", policy);

        let started = std::time::Instant::now();
        let mut responses = client
            .request_multi::<u64, (String, u64)>("add_one_multi", &1, RequestOptions::default())
            .await
            .unwrap();
        let mut answers = Vec::new();
        while let Some(response) = responses.recv().await {
            answers.push(response);
        }

        assert_eq!(answers.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        let failed = answers.iter().find(|a| a.result.is_err()).unwrap();
        assert_eq!(failed.server_id, broken.server_id());
        assert_eq!(failed.result.as_ref().unwrap_err().code(), ErrorCode::Internal);
        let ok = answers.iter().find(|a| a.result.is_ok()).unwrap();
        assert_eq!(ok.server_id, healthy.server_id());
    }

    #[tokio::test]
    async fn test_cancelled_broadcast_stops_delivering() {
        let policy = MethodPolicy::broadcast();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fast = server(&bus, "add_one_multi", policy);
        let slow = server(&bus, "add_one_multi", policy);
        register_add_one(&fast, "add_one_multi", calls.clone(), Topic::none()).await;
        slow.register_handler(
            "add_one_multi",
            |info: RpcInfo, n: u64| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok((info.request_id, n + 1))
            },
            HandlerOptions::default(),
        )
        .await
        .unwrap();
        let client = client(&bus, "add_one_multi", policy);

        let mut responses = client
            .request_multi::<u64, (String, u64)>("add_one_multi", &1, RequestOptions::default())
            .await
            .unwrap();
        let first = responses.recv().await.unwrap();
        assert_eq!(first.server_id, fast.server_id());
        assert_eq!(first.result.unwrap().1, 2);

        responses.cancel();
        let started = std::time::Instant::now();
        assert!(responses.recv().await.is_none());
        assert!(started.elapsed() < Duration::from_millis(100));

        // The slow answer arriving later is never delivered.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(responses.recv().await.is_none());
    }

    // =============================================================================
    // TOPICS
    // =============================================================================

    #[tokio::test]
    async fn test_topic_scoped_handlers() {
        let policy = MethodPolicy::unicast().with_queue();
        for mode in MODES {
            let bus = bus(mode);
            let eu_calls = Arc::new(Mutex::new(Vec::new()));
            let us_calls = Arc::new(Mutex::new(Vec::new()));
            let eu = server(&bus, "add_one", policy);
            let us = server(&bus, "add_one", policy);
            register_add_one(&eu, "add_one", eu_calls.clone(), Topic::new(["eu"])).await;
            register_add_one(&us, "add_one", us_calls.clone(), Topic::new(["us"])).await;
            let client = client(&bus, "add_one", policy);

            for _ in 0..3 {
                let _: (String, u64) = client
                    .request_single(
                        "add_one",
                        &1u64,
                        RequestOptions::default().with_topic(Topic::new(["eu"])),
                    )
                    .await
                    .unwrap();
            }

            assert_eq!(eu_calls.lock().len(), 3);
            assert_eq!(us_calls.lock().len(), 0);

            // Nobody serves the unscoped channel.
            let err = client
                .request_single::<u64, (String, u64)>("add_one", &1, short())
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
        }
    }

    // =============================================================================
    // LIFECYCLE
    // =============================================================================

    #[tokio::test]
    async fn test_deregistered_handler_stops_receiving() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let server = server(&bus, "add_one", policy);
        register_add_one(&server, "add_one", calls.clone(), Topic::none()).await;
        let client = client(&bus, "add_one", policy);

        let _: (String, u64) = client
            .request_single("add_one", &1u64, RequestOptions::default())
            .await
            .unwrap();
        server
            .deregister_handler("add_one", &Topic::none())
            .await
            .unwrap();

        let err = client
            .request_single::<u64, (String, u64)>("add_one", &1, short())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
        assert_eq!(calls.lock().len(), 1);

        // The slot is free again.
        register_add_one(&server, "add_one", calls.clone(), Topic::none()).await;
    }

    #[tokio::test]
    async fn test_draining_close_waits_for_handlers() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Structured);
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let server = server(&bus, "slow", policy);
        {
            let started = started.clone();
            let finished = finished.clone();
            server
                .register_handler(
                    "slow",
                    move |_info: RpcInfo, n: u64| {
                        let started = started.clone();
                        let finished = finished.clone();
                        async move {
                            started.notify_one();
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            finished.store(true, Ordering::SeqCst);
                            Ok(n)
                        }
                    },
                    HandlerOptions::default(),
                )
                .await
                .unwrap();
        }
        let client = client(&bus, "slow", policy);

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .request_single::<u64, u64>("slow", &7, RequestOptions::default())
                    .await
            }
        });
        started.notified().await;
        server.close(true).await;

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(call.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closed_server_stops_serving() {
        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let server = server(&bus, "add_one", policy);
        register_add_one(&server, "add_one", calls.clone(), Topic::none()).await;
        server.close(false).await;
        let client = client(&bus, "add_one", policy);

        let err = client
            .request_single::<u64, (String, u64)>("add_one", &1, short())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
        assert_eq!(calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_method_is_invalid() {
        let bus = bus(busrpc::RoutingMode::Legacy);
        let client = RpcClient::new(ServiceDefinition::client(SERVICE), bus.clone());

        let err = client
            .request_single::<u64, u64>("missing", &1, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let server = busrpc::RpcServer::new(ServiceDefinition::server(SERVICE), bus);
        let err = server
            .register_handler(
                "missing",
                |_info: RpcInfo, n: u64| async move { Ok(n) },
                HandlerOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_invalid_policies_rejected() {
        let bus = bus(busrpc::RoutingMode::Legacy);
        let client = RpcClient::new(ServiceDefinition::client(SERVICE), bus);

        let invalid = [
            MethodPolicy::broadcast().with_claim(),
            MethodPolicy::unicast().with_queue().with_claim(),
            MethodPolicy {
                affinity_enabled: true,
                ..MethodPolicy::unicast()
            },
        ];
        for policy in invalid {
            let err = client.register_method("bad", policy).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{policy:?}");
        }
    }

    #[tokio::test]
    async fn test_separators_in_names_rejected() {
        let bus = bus(busrpc::RoutingMode::Structured);
        let policy = MethodPolicy::unicast().with_queue();

        let unregistered = RpcClient::new(ServiceDefinition::client(SERVICE), bus.clone());
        for method in ["a.b", "a|b", ""] {
            let err = unregistered.register_method(method, policy).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{method:?}");
        }

        let server = server(&bus, "add_one", policy);
        let err = server
            .register_handler(
                "add_one",
                |_info: RpcInfo, n: u64| async move { Ok(n + 1) },
                HandlerOptions::default().with_topic(Topic::new(["b.c"])),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let client = client(&bus, "add_one", policy);
        let err = client
            .request_single::<u64, u64>(
                "add_one",
                &1,
                RequestOptions::default().with_topic(Topic::new(["b|c"])),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_interceptors_wrap_handler() {
        use async_trait::async_trait;
        use busrpc::{Next, ServerInterceptor};

        struct Audit(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl ServerInterceptor for Audit {
            async fn intercept(
                &self,
                info: RpcInfo,
                payload: Vec<u8>,
                next: Next,
            ) -> Result<Vec<u8>, RpcError> {
                self.0.lock().push(info.method.clone());
                next.run(info, payload).await
            }
        }

        let policy = MethodPolicy::unicast().with_queue();
        let bus = bus(busrpc::RoutingMode::Legacy);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let server = server(&bus, "add_one", policy);
        server
            .register_handler(
                "add_one",
                |_info: RpcInfo, n: u64| async move { Ok(n + 1) },
                HandlerOptions::default().with_interceptor(Arc::new(Audit(seen.clone()))),
            )
            .await
            .unwrap();
        let client = client(&bus, "add_one", policy);

        let sum: u64 = client
            .request_single("add_one", &1u64, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(sum, 2);
        assert_eq!(*seen.lock(), vec!["add_one".to_string()]);
    }
}
