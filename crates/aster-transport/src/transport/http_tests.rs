//! Behavioural tests for the HTTP transport against a mock server

#[cfg(test)]
mod mock_server_tests {
    use crate::config::HttpConfig;
    use crate::error::McpError;
    use crate::transport::{HttpTransport, Transport};
    use crate::types::{ConnectionOptions, ConnectionStatus};
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> ConnectionOptions {
        ConnectionOptions::with_timeout(Duration::from_secs(5))
    }

    async fn mount_probe(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    async fn connected(server: &MockServer) -> HttpTransport {
        mount_probe(server, 405).await;
        let transport = HttpTransport::new(HttpConfig::new(format!("{}/mcp", server.uri())), options());
        transport.connect(None).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn probe_405_counts_as_reachable() {
        let server = MockServer::start().await;
        let transport = connected(&server).await;
        assert_eq!(transport.status(), ConnectionStatus::Connected);
        assert!(transport.core().buffered().is_empty());
    }

    #[tokio::test]
    async fn probe_error_status_fails_connect() {
        let server = MockServer::start().await;
        mount_probe(&server, 503).await;
        let transport = HttpTransport::new(HttpConfig::new(format!("{}/mcp", server.uri())), options());

        let err = transport.connect(None).await.unwrap_err();
        match err {
            McpError::Http { status, .. } => assert_eq!(status, 503),
            other => panic!("Expected Http error, got {other:?}"),
        }
        assert_eq!(transport.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn probe_refused_is_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = HttpTransport::new(
            HttpConfig::new(format!("http://127.0.0.1:{}/mcp", port)),
            options(),
        );
        let err = transport.connect(None).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
        assert_eq!(transport.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn probe_event_stream_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("data: hello\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(HttpConfig::new(format!("{}/mcp", server.uri())), options());
        transport.connect(None).await.unwrap();
        assert_eq!(transport.wait_for_data(None).await.unwrap(), "hello\n");
        // The probe stream ending does not end the session.
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn send_posts_message_and_delivers_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("content-type", "application/json"))
            .and(header("authorization", "Bearer secret"))
            .and(body_string(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;
        mount_probe(&server, 405).await;

        let mut config = HttpConfig::new(format!("{}/mcp", server.uri()));
        config
            .headers
            .insert("Authorization".to_string(), "Bearer secret".to_string());
        let transport = HttpTransport::new(config, options());
        transport.connect(None).await.unwrap();

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(
            transport.wait_for_data(None).await.unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#
        );
    }

    #[tokio::test]
    async fn send_error_status_keeps_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such endpoint"))
            .mount(&server)
            .await;
        let transport = connected(&server).await;

        let err = transport.send("{}").await.unwrap_err();
        match &err {
            McpError::Http { status, message, .. } => {
                assert_eq!(*status, 404);
                assert!(message.contains("no such endpoint"));
            }
            other => panic!("Expected Http error, got {other:?}"),
        }
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn accepted_without_body_delivers_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let transport = connected(&server).await;

        transport.send("{}").await.unwrap();
        assert!(transport.core().buffered().is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_becomes_units() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: message\ndata: {\"id\":1}\n\ndata: {\"id\":2}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;
        let transport = connected(&server).await;

        transport.send("{}").await.unwrap();
        let first = transport.wait_for_data(None).await.unwrap();
        assert!(first.starts_with("{\"id\":1}\n"));
        if first == "{\"id\":1}\n" {
            assert_eq!(transport.wait_for_data(None).await.unwrap(), "{\"id\":2}\n");
        } else {
            assert_eq!(first, "{\"id\":1}\n{\"id\":2}\n");
        }
    }

    #[tokio::test]
    async fn session_id_is_echoed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("second"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Mcp-Session-Id", "abc123")
                    .set_body_string("first"),
            )
            .mount(&server)
            .await;
        let transport = connected(&server).await;

        transport.send("{}").await.unwrap();
        assert_eq!(transport.wait_for_data(None).await.unwrap(), "first");
        assert_eq!(transport.session_id().as_deref(), Some("abc123"));

        transport.send("{}").await.unwrap();
        assert_eq!(transport.wait_for_data(None).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn send_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        mount_probe(&server, 405).await;
        let transport = HttpTransport::new(
            HttpConfig::new(format!("{}/mcp", server.uri())),
            ConnectionOptions::with_timeout(Duration::from_millis(300)),
        );
        transport.connect(None).await.unwrap();

        let err = transport.send("{}").await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn connect_options_add_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .and(header("x-trace", "on"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(HttpConfig::new(format!("{}/mcp", server.uri())), options());
        let mut call = ConnectionOptions::default();
        call.headers.insert("X-Trace".to_string(), "on".to_string());
        transport.connect(Some(call)).await.unwrap();
    }

    #[tokio::test]
    async fn unprobed_transport_fails_on_first_send() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = HttpConfig::new(format!("http://127.0.0.1:{}/mcp", port));
        config.probe = false;
        let transport = HttpTransport::new(config, options());
        transport.connect(None).await.unwrap();

        let err = transport.send("{}").await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn close_drops_buffered_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("reply"))
            .mount(&server)
            .await;
        let transport = connected(&server).await;
        transport.send("{}").await.unwrap();

        transport.close().await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert_eq!(transport.wait_for_data(None).await.unwrap(), "");
        assert!(transport.send("{}").await.unwrap_err().is_not_connected());
    }
}
