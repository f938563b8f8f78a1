mod common;

#[cfg(test)]
mod tests {
    use super::common::{fake_upstream, UPSTREAM_KEY};
    use gofw::error::GofwError;
    use gofw::protocol::Target;
    use gofw::tunnel::upstream::{
        accept_channel, connect_upstream, open_datagram, seal_datagram, MAX_FRAME_PAYLOAD, STATUS_OK,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_channel_round_trip() {
        let upstream = fake_upstream("").await.to_string();
        let target = Target::new("example.com", 443);

        let channel = connect_upstream(&upstream, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT)
            .await
            .unwrap();
        let stream = channel.into_stream();

        // Larger than one frame so the payload is split.
        let payload: Vec<u8> = (0..3 * MAX_FRAME_PAYLOAD + 17).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let (mut rd, mut wr) = tokio::io::split(stream);
        let writer = tokio::spawn(async move {
            wr.write_all(&payload).await.unwrap();
            wr.shutdown().await.unwrap();
        });

        let mut echoed = Vec::new();
        rd.read_to_end(&mut echoed).await.unwrap();
        writer.await.unwrap();
        assert_eq!(echoed, expected);
    }

    #[tokio::test]
    async fn test_dropped_stream_still_delivers_buffered_upload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();
        let (count_tx, count_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (_, pending) = accept_channel(socket, UPSTREAM_KEY).await.unwrap();
            let mut stream = pending.respond(STATUS_OK).await.unwrap().into_stream();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            let _ = count_tx.send(received.len());
        });

        let target = Target::new("example.com", 80);
        let mut stream = connect_upstream(&upstream, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT)
            .await
            .unwrap()
            .into_stream();
        let upload = vec![7u8; 30_000];
        stream.write_all(&upload).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let received = tokio::time::timeout(Duration::from_secs(5), count_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, upload.len());
    }

    #[tokio::test]
    async fn test_wrong_credential_is_refused() {
        let upstream = fake_upstream("user:pass").await.to_string();
        let target = Target::new("example.com", 443);

        let err = connect_upstream(&upstream, UPSTREAM_KEY, &target, "user:wrong", CONNECT_TIMEOUT)
            .await
            .err()
            .unwrap();
        match err {
            GofwError::UpstreamUnreachable { addr, reason } => {
                assert_eq!(addr, upstream);
                assert!(reason.contains("credentials"), "{}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_destination() {
        let upstream = fake_upstream("").await.to_string();
        let target = Target::new("example.com", 1);
        let result = connect_upstream(&upstream, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(GofwError::UpstreamUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_wrong_key_fails_handshake() {
        let upstream = fake_upstream("").await.to_string();
        let target = Target::new("example.com", 443);
        let result = connect_upstream(&upstream, b"another-key", &target, "", CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(GofwError::UpstreamUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let target = Target::new("example.com", 443);
        let result = connect_upstream(&addr, UPSTREAM_KEY, &target, "", CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(GofwError::UpstreamUnreachable { .. })));
    }

    #[test]
    fn test_datagram_key_mismatch() {
        let sealed = seal_datagram(UPSTREAM_KEY, b"dns query").unwrap();
        assert_eq!(open_datagram(UPSTREAM_KEY, &sealed).unwrap(), b"dns query");
        assert!(open_datagram(b"other", &sealed).is_err());
        assert!(open_datagram(UPSTREAM_KEY, &sealed[..10]).is_err());
    }
}
