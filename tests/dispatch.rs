// End-to-end dispatch tests driving Server::handle directly, no sockets.
#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex, atomic::Ordering};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode, header},
    };
    use futures_util::FutureExt;
    use http_body_util::BodyExt;
    use serde::{Deserialize, Serialize};
    use synapse::{
        config::RuntimeConfig,
        core::{
            Access, EndpointDesc, EndpointEntry, Registry, Server, ServerBuilder,
            desc::TypedHandler,
        },
        ports::{
            http_client::{HttpClient, HttpClientError, HttpClientResult},
            trace::CountingTracer,
        },
    };

    struct NoClient;

    #[async_trait]
    impl HttpClient for NoClient {
        async fn send_request(
            &self,
            _req: HttpRequest<Body>,
        ) -> HttpClientResult<axum::http::Response<Body>> {
            Err(HttpClientError::ConnectionError("no network in tests".into()))
        }
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct EchoReq {
        msg: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct EchoResp {
        msg: String,
    }

    fn entry(endpoint: &str, access: Access, expose: bool, method: &str, path: &str) -> EndpointEntry {
        EndpointEntry {
            service: "users".into(),
            endpoint: endpoint.into(),
            access,
            expose,
            methods: vec![method.into()],
            path: path.into(),
            raw: false,
            fallback: false,
        }
    }

    fn register_endpoints(registry: &Arc<Registry>) {
        let echo: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("Echo", Access::Public, true, "POST", "/echo"),
                echo,
            ))
            .unwrap();

        let boom: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|_req| async move { panic!("handler exploded") }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("Boom", Access::Public, true, "POST", "/boom"),
                boom,
            ))
            .unwrap();

        let secret: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("Secret", Access::RequiresAuth, true, "POST", "/secret"),
                secret,
            ))
            .unwrap();

        let hidden: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("Hidden", Access::Private, false, "POST", "/hidden"),
                hidden,
            ))
            .unwrap();

        let things: TypedHandler<serde_json::Value, serde_json::Value> =
            Arc::new(|req| async move { Ok(req) }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("ListThings", Access::Public, true, "GET", "/things"),
                things,
            ))
            .unwrap();

        let items: TypedHandler<serde_json::Value, serde_json::Value> =
            Arc::new(|req| async move { Ok(req) }.boxed());
        registry
            .register_endpoint(EndpointDesc::new(
                entry("CreateItem", Access::Public, true, "POST", "/items"),
                items,
            ))
            .unwrap();
    }

    fn test_server(tracer: Arc<CountingTracer>) -> Arc<Server> {
        let config = RuntimeConfig {
            hosted_services: vec!["users".into()],
            app: synapse::config::AppMeta {
                app_revision: "abc123".into(),
                deploy_id: "deploy-1".into(),
                compiler_version: "v1.0".into(),
                enabled_experiments: vec![],
            },
            ..Default::default()
        };
        let builder = ServerBuilder::new(config)
            .tracer(tracer)
            .http_client(Arc::new(NoClient));
        register_endpoints(builder.registry());
        builder.build().unwrap()
    }

    fn post_json(path: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let resp = server.handle(post_json("/echo", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(resp.headers().contains_key("x-request-id"));
        assert!(resp.headers().contains_key("x-encore-trace-id"));

        let body = body_json(resp).await;
        assert_eq!(body, serde_json::json!({"msg": "hi"}));
        assert_eq!(tracer.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_request_id_is_echoed_back() {
        let server = test_server(CountingTracer::new());

        let req = HttpRequest::builder()
            .method("POST")
            .uri("/echo")
            .header("x-request-id", "client-chosen-id")
            .body(Body::from(r#"{"msg":"hi"}"#))
            .unwrap();
        let resp = server.handle(req).await;
        assert_eq!(
            resp.headers().get("x-request-id").unwrap(),
            "client-chosen-id"
        );
    }

    #[tokio::test]
    async fn test_generated_request_id_matches_trace_id() {
        let server = test_server(CountingTracer::new());

        let resp = server.handle(post_json("/echo", r#"{"msg":"hi"}"#)).await;
        let request_id = resp.headers().get("x-request-id").unwrap();
        let trace_id = resp.headers().get("x-encore-trace-id").unwrap();
        assert_eq!(request_id, trace_id);
    }

    #[tokio::test]
    async fn test_non_gateway_does_not_proxy_unhosted_service() {
        let tracer = CountingTracer::new();
        let config = RuntimeConfig {
            hosted_services: vec!["users".into()],
            service_discovery: [("billing".to_string(), "http://billing.local".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let builder = ServerBuilder::new(config)
            .tracer(tracer)
            .http_client(Arc::new(NoClient));
        let charge: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        builder
            .registry()
            .register_endpoint(EndpointDesc::new(
                EndpointEntry {
                    service: "billing".into(),
                    endpoint: "Charge".into(),
                    access: Access::Public,
                    expose: true,
                    methods: vec!["POST".into()],
                    path: "/charge".into(),
                    raw: false,
                    fallback: false,
                },
                charge,
            ))
            .unwrap();
        let server = builder.build().unwrap();

        // Without a gateway declaration the unhosted route is not proxied.
        let resp = server.handle(post_json("/charge", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gateway_proxies_unhosted_service() {
        let tracer = CountingTracer::new();
        let config = RuntimeConfig {
            hosted_services: vec!["users".into()],
            gateways: vec!["api".into()],
            service_discovery: [("billing".to_string(), "http://billing.local".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let builder = ServerBuilder::new(config)
            .tracer(tracer)
            .http_client(Arc::new(NoClient));
        let charge: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        builder
            .registry()
            .register_endpoint(EndpointDesc::new(
                EndpointEntry {
                    service: "billing".into(),
                    endpoint: "Charge".into(),
                    access: Access::Public,
                    expose: true,
                    methods: vec!["POST".into()],
                    path: "/charge".into(),
                    raw: false,
                    fallback: false,
                },
                charge,
            ))
            .unwrap();
        let server = builder.build().unwrap();

        // The proxy attempt reaches the (failing) client, surfacing 503.
        let resp = server.handle(post_json("/charge", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected_without_tracking() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let resp = server.handle(post_json("/echo", "{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty(), "malformed payload gets an empty body");
        assert_eq!(tracer.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_tracked_then_rejected() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let resp = server.handle(post_json("/echo", r#"{"msg": 42}"#)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "invalid_argument");
        // Well-formed JSON of the wrong shape still begins tracking.
        assert_eq!(tracer.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_requires_auth_without_credentials() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let resp = server.handle(post_json("/secret", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "unauthenticated");
        // Rejected before the request ever began tracking.
        assert_eq!(tracer.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained_and_paired() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let resp = server.handle(post_json("/boom", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "internal");
        // Sanitized for boundary clients.
        assert_eq!(body["message"], "internal error");
        assert_eq!(tracer.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_private_endpoint_is_invisible_externally() {
        let server = test_server(CountingTracer::new());

        let resp = server.handle(post_json("/hidden", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_trailing_slash_redirects() {
        let server = test_server(CountingTracer::new());

        let req = HttpRequest::builder()
            .method("GET")
            .uri("/things/")
            .body(Body::empty())
            .unwrap();
        let resp = server.handle(req).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/things");

        // Non-GET methods preserve the method across the redirect.
        let resp = server.handle(post_json("/items/", "{}")).await;
        assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/items");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let server = test_server(CountingTracer::new());
        let resp = server.handle(post_json("/nope", "{}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_draining_refuses_with_retry_hint() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());
        server.mark_draining();

        let resp = server.handle(post_json("/echo", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
        assert_eq!(tracer.counts(), (0, 0));
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_healthz_reports_deploy_metadata() {
        let server = test_server(CountingTracer::new());

        let req = HttpRequest::builder()
            .method("GET")
            .uri("/__encore/healthz")
            .body(Body::empty())
            .unwrap();
        let resp = server.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "ok");
        assert_eq!(body["details"]["app_revision"], "abc123");
        assert_eq!(body["details"]["deploy_id"], "deploy-1");
        assert_eq!(body["details"]["compiler_version"], "v1.0");
        assert_eq!(body["details"]["checks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_healthz_flips_on_shutdown_signal() {
        let server = test_server(CountingTracer::new());
        server.mark_unhealthy();

        let req = HttpRequest::builder()
            .method("GET")
            .uri("/__encore/healthz")
            .body(Body::empty())
            .unwrap();
        let resp = server.handle(req).await;
        // Unhealthy, yet still serving: only draining refuses requests.
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "unhealthy");
    }

    #[tokio::test]
    async fn test_pubsub_push_delivery() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());

        let received: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let received_clone = received.clone();
        server
            .registry()
            .register_subscription(
                "orders-sub",
                Arc::new(move |msg| {
                    let received = received_clone.clone();
                    async move {
                        *received.lock().unwrap() = Some(msg);
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .unwrap();

        let resp = server
            .handle(post_json(
                "/__encore/pubsub/push/orders-sub",
                r#"{"order_id": 7}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            *received.lock().unwrap(),
            Some(serde_json::json!({"order_id": 7}))
        );
        assert_eq!(tracer.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_pubsub_push_missing_subscription_id() {
        let server = test_server(CountingTracer::new());
        let resp = server.handle(post_json("/__encore/pubsub/push/", "{}")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pubsub_push_unknown_subscription() {
        let server = test_server(CountingTracer::new());
        let resp = server
            .handle(post_json("/__encore/pubsub/push/ghost-sub", "{}"))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pubsub_handler_error_is_tracked() {
        let tracer = CountingTracer::new();
        let server = test_server(tracer.clone());
        server
            .registry()
            .register_subscription(
                "flaky-sub",
                Arc::new(|_msg| {
                    async { Err(synapse::ApiError::unavailable("downstream is gone")) }.boxed()
                }),
            )
            .unwrap();

        let resp = server
            .handle(post_json("/__encore/pubsub/push/flaky-sub", "{}"))
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(tracer.counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_in_flight_counter_settles() {
        let server = test_server(CountingTracer::new());
        let _ = server.handle(post_json("/echo", r#"{"msg":"hi"}"#)).await;
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_in_process_call_through_desc() {
        let server = test_server(CountingTracer::new());
        let echo: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        let desc = EndpointDesc::new(
            entry("EchoDirect", Access::Public, true, "POST", "/echo-direct"),
            echo,
        );

        let resp = desc
            .call(&server, EchoReq { msg: "direct".into() })
            .await
            .unwrap();
        assert_eq!(resp.msg, "direct");
    }

    #[tokio::test]
    async fn test_mock_overrides_endpoint_call() {
        let server = test_server(CountingTracer::new());
        let real: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|req| async move { Ok(EchoResp { msg: req.msg }) }.boxed());
        let desc = EndpointDesc::new(
            entry("Mocked", Access::Public, true, "POST", "/mocked"),
            real,
        );

        let mock: TypedHandler<EchoReq, EchoResp> =
            Arc::new(|_req| async move { Ok(EchoResp { msg: "from mock".into() }) }.boxed());
        server.registry().set_mock(
            "users",
            "Mocked",
            synapse::core::desc::erase_mock(mock),
            false,
        );

        let resp = desc
            .call(&server, EchoReq { msg: "ignored".into() })
            .await
            .unwrap();
        assert_eq!(resp.msg, "from mock");

        server.registry().clear_mock("users", "Mocked");
        let resp = desc
            .call(&server, EchoReq { msg: "real again".into() })
            .await
            .unwrap();
        assert_eq!(resp.msg, "real again");
    }

    #[tokio::test]
    async fn test_middleware_sees_requests_and_adds_headers() {
        let hits = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let hits_clone = hits.clone();
        let config = RuntimeConfig {
            hosted_services: vec!["users".into()],
            ..Default::default()
        };
        let builder = ServerBuilder::new(config)
            .tracer(CountingTracer::new())
            .http_client(Arc::new(NoClient))
            .middleware(Arc::new(move |ctx, next| {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let mut resp = next.run(ctx).await;
                    resp.headers
                        .insert("x-observed", "yes".parse().unwrap());
                    resp
                }
                .boxed()
            }));
        register_endpoints(builder.registry());
        let server = builder.build().unwrap();

        let resp = server.handle(post_json("/echo", r#"{"msg":"hi"}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-observed").unwrap(), "yes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
