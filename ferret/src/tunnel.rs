//! Byte relay between an intercepted client and the origin server.

use std::time::Duration;

use tokio::io::{
    AsyncRead,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::{
    capture::{
        self,
        RelayBuffer,
    },
    record::RequestSink,
};

/// Relays bytes between `client` and `origin` in both directions, feeding
/// the client-to-origin half into a capture tap.
///
/// Returns when both directions have shut down (or failed) and the tap has
/// drained. Relay errors are expected on abrupt peer closes and only logged.
pub(crate) async fn relay<C, O, S>(
    client: C,
    origin: O,
    target: String,
    sink: S,
    idle_timeout: Duration,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: RequestSink,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let buffer = RelayBuffer::new();
    let tap = tokio::spawn(capture::tap(
        buffer.clone(),
        target,
        sink,
        idle_timeout,
    ));

    let upstream = {
        let buffer = buffer.clone();
        async move {
            let result = capture::copy_tapped(&mut client_read, &mut origin_write, &buffer).await;
            buffer.close();
            let _ = origin_write.shutdown().await;
            result
        }
    };

    let downstream = async move {
        let result = tokio::io::copy(&mut origin_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (upstream_result, downstream_result) = tokio::join!(upstream, downstream);
    if let Err(error) = upstream_result {
        tracing::debug!(%error, "upstream relay ended with an error");
    }
    if let Err(error) = downstream_result {
        tracing::debug!(%error, "downstream relay ended with an error");
    }

    let _ = tap.await;
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{
            Arc,
            Mutex,
        },
    };

    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };

    use super::*;
    use crate::record::CapturedRequest;

    #[derive(Clone, Default)]
    struct TestSink {
        records: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    impl RequestSink for TestSink {
        type Error = Infallible;

        async fn save(&self, record: CapturedRequest) -> Result<(), Infallible> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    #[tokio::test]
    async fn bytes_relay_verbatim_in_both_directions() {
        let (client_side, client_peer) = tokio::io::duplex(1024);
        let (origin_side, origin_peer) = tokio::io::duplex(1024);
        let sink = TestSink::default();

        let relay_task = tokio::spawn(relay(
            client_peer,
            origin_peer,
            "example.com:443".to_owned(),
            sink.clone(),
            Duration::from_millis(200),
        ));

        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        let (mut origin_read, mut origin_write) = tokio::io::split(origin_side);

        client_write
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        let mut seen = Vec::new();
        origin_read.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        origin_write.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        origin_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");

        relay_task.await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "example.com:443");
    }
}
