mod common;

#[cfg(test)]
mod tests {
    use super::common::{echo_server, UPSTREAM_KEY};
    use gofw::config::{Role, ServerConfig, TimeoutConfig};
    use gofw::error::GofwError;
    use gofw::mode::{ProxyMode, RoutePolicy};
    use gofw::protocol::socks5::{decode_udp_header, encode_udp_header};
    use gofw::protocol::Target;
    use gofw::server::ServerSupervisor;
    use gofw::tunnel::upstream::{connect_upstream, open_datagram, seal_datagram};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    fn upstream_config(auth: &str) -> ServerConfig {
        ServerConfig {
            role: Role::Server,
            local_addr: "127.0.0.1".to_string(),
            control_port: 0,
            key: String::from_utf8(UPSTREAM_KEY.to_vec()).unwrap(),
            auth: auth.to_string(),
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> ServerSupervisor {
        let supervisor = ServerSupervisor::new();
        supervisor.start(config).await.unwrap();
        supervisor
    }

    #[tokio::test]
    async fn test_sealed_channel_reaches_the_target() {
        let echo = echo_server().await;
        let supervisor = start(upstream_config("")).await;
        assert!(supervisor.nickname().unwrap().ends_with("@direct"));

        let upstream = supervisor.local_addr().unwrap().to_string();
        let target = Target::new(echo.ip().to_string(), echo.port());
        let channel = connect_upstream(&upstream, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT)
            .await
            .unwrap();
        let mut stream = channel.into_stream();
        stream.write_all(b"through the upstream").await.unwrap();
        let mut buf = [0u8; 20];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the upstream");

        let messages: Vec<String> = supervisor
            .log_buffer()
            .unwrap()
            .snapshot()
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert!(messages.iter().any(|m| m.contains("started") && m.contains("upstream role")));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_credentials_are_refused() {
        let echo = echo_server().await;
        let supervisor = start(upstream_config("user:pass")).await;
        let upstream = supervisor.local_addr().unwrap().to_string();
        let target = Target::new(echo.ip().to_string(), echo.port());

        let err = connect_upstream(&upstream, UPSTREAM_KEY, &target, "user:nope", CONNECT_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("credentials"), "{}", err);

        let ok = connect_upstream(&upstream, UPSTREAM_KEY, &target, "user:pass", CONNECT_TIMEOUT).await;
        assert!(ok.is_ok());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_target_is_reported() {
        let supervisor = start(upstream_config("")).await;
        let upstream = supervisor.local_addr().unwrap().to_string();

        // a port that was free a moment ago
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let target = Target::new(closed.ip().to_string(), closed.port());
        let err = connect_upstream(&upstream, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GofwError::UpstreamUnreachable { .. }));
        assert!(err.to_string().contains("status 2"), "{}", err);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_plain_proxy_requests_are_not_served() {
        let config = ServerConfig {
            timeouts: TimeoutConfig {
                handshake_secs: 1,
                ..TimeoutConfig::default()
            },
            ..upstream_config("")
        };
        let supervisor = start(config).await;
        let mut client = TcpStream::connect(supervisor.local_addr().unwrap()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        // the greeting is read as a salt; the connection ends without a reply
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_sealed_datagrams_go_direct() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let supervisor = start(upstream_config("")).await;
        let control = supervisor.local_addr().unwrap();
        let data: SocketAddr = supervisor.data_addr().unwrap();
        assert_eq!(data.port(), control.port());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Target::new(echo_addr.ip().to_string(), echo_addr.port());
        let mut plain = encode_udp_header(&target);
        plain.extend_from_slice(b"sealed ping");

        // an unsealed datagram is ignored
        client.send_to(&plain, data).await.unwrap();
        client
            .send_to(&seal_datagram(UPSTREAM_KEY, &plain).unwrap(), data)
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = open_datagram(UPSTREAM_KEY, &buf[..n]).unwrap();
        let (source, payload) = decode_udp_header(&reply).unwrap();
        assert_eq!(source, target);
        assert_eq!(payload, b"sealed ping");

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_role_needs_a_key() {
        let supervisor = ServerSupervisor::new();
        let config = ServerConfig {
            key: String::new(),
            proxy_mode: ProxyMode::Socks,
            route_policy: RoutePolicy::Global,
            ..upstream_config("")
        };
        assert!(matches!(supervisor.start(config).await, Err(GofwError::Config(_))));
        assert!(!supervisor.is_running());
    }
}
