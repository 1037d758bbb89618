//! Observational capture of requests flowing through a tunnel.
//!
//! The relay copies bytes verbatim and pushes a copy of the client half into
//! a [`RelayBuffer`]. A tap task re-parses the buffer into records and hands
//! them to a [`RequestSink`]. Capture never stalls or alters the relayed
//! bytes; when parsing fails the buffer is dropped and the tunnel keeps
//! going.

use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
    },
    sync::Notify,
};

use crate::{
    codec::{
        self,
        ParseError,
    },
    record::{
        RequestSink,
        Scheme,
    },
};

/// How long the tap waits for more bytes before giving up on a partial
/// request.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

const COPY_BUF_SIZE: usize = 8192;

/// A byte buffer shared between the relay and the tap.
pub(crate) struct RelayBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

#[derive(Default)]
struct BufferState {
    data: Vec<u8>,
    closed: bool,
}

impl RelayBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        })
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.data.extend_from_slice(bytes);
        drop(state);
        self.notify.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }
}

enum Step {
    Parsed(crate::record::CapturedRequest),
    Wait,
    Closed,
}

/// Drains `buffer` into request records until the stream closes or goes
/// idle.
///
/// Each parsed record is stamped with the tunnel `target` as its host and
/// `https` as its scheme, since the tunnel itself no longer carries either.
/// Bytes that don't parse as a request are discarded.
pub(crate) async fn tap<S: RequestSink>(
    buffer: Arc<RelayBuffer>,
    target: String,
    sink: S,
    idle_timeout: Duration,
) {
    loop {
        let step = {
            let mut state = buffer.state.lock().unwrap();
            match codec::from_raw_bytes(&state.data) {
                Ok(parsed) => {
                    state.data.drain(..parsed.consumed);
                    Step::Parsed(parsed.record)
                }
                Err(ParseError::Incomplete) => {
                    if state.closed && state.data.is_empty() {
                        Step::Closed
                    }
                    else if state.closed {
                        // a trailing fragment that will never complete
                        tracing::debug!(target = %target, "dropping trailing partial request");
                        Step::Closed
                    }
                    else {
                        Step::Wait
                    }
                }
                Err(error) => {
                    tracing::debug!(target = %target, %error, "dropping unparseable bytes");
                    state.data.clear();
                    if state.closed {
                        Step::Closed
                    }
                    else {
                        Step::Wait
                    }
                }
            }
        };

        match step {
            Step::Parsed(mut record) => {
                record.host = target.clone();
                record.scheme = Scheme::Https;
                if let Err(error) = sink.save(record).await {
                    tracing::warn!(%error, "failed to save captured request");
                }
            }
            Step::Wait => {
                tokio::select! {
                    _ = buffer.notify.notified() => {}
                    _ = tokio::time::sleep(idle_timeout) => {
                        tracing::debug!(target = %target, "capture tap idle, stopping");
                        break;
                    }
                }
            }
            Step::Closed => break,
        }
    }
}

/// Copies `reader` to `writer` while feeding every chunk into `buffer`.
pub(crate) async fn copy_tapped<R, W>(
    mut reader: R,
    writer: &mut W,
    buffer: &RelayBuffer,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        buffer.push(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

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
    async fn complete_requests_are_captured_with_the_tunnel_target() {
        let buffer = RelayBuffer::new();
        let sink = TestSink::default();

        buffer.push(b"GET /path HTTP/1.1\r\nHost: ignored.example\r\n\r\n");
        buffer.close();

        tap(
            buffer,
            "example.com:443".to_owned(),
            sink.clone(),
            DEFAULT_IDLE_TIMEOUT,
        )
        .await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].scheme, Scheme::Https);
        assert_eq!(records[0].host, "example.com:443");
    }

    #[tokio::test]
    async fn requests_split_across_pushes_are_reassembled() {
        let buffer = RelayBuffer::new();
        let sink = TestSink::default();

        let tap_task = tokio::spawn(tap(
            buffer.clone(),
            "example.com:443".to_owned(),
            sink.clone(),
            DEFAULT_IDLE_TIMEOUT,
        ));

        buffer.push(b"POST /a HTTP/1.1\r\nContent-");
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(b"Length: 5\r\n\r\nhel");
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(b"lo");
        buffer.close();

        tap_task.await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "POST");
        assert_eq!(records[0].body, b"hello");
    }

    #[tokio::test]
    async fn unparseable_bytes_are_dropped_without_stopping_the_tap() {
        let buffer = RelayBuffer::new();
        let sink = TestSink::default();

        let tap_task = tokio::spawn(tap(
            buffer.clone(),
            "example.com:443".to_owned(),
            sink.clone(),
            DEFAULT_IDLE_TIMEOUT,
        ));

        buffer.push(b"\x16\x03\x01\x02\x00 tls-looking garbage\r\n\r\n");
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(b"GET / HTTP/1.1\r\n\r\n");
        buffer.close();

        tap_task.await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "GET");
    }

    #[tokio::test]
    async fn the_tap_stops_after_the_idle_timeout() {
        let buffer = RelayBuffer::new();
        let sink = TestSink::default();

        buffer.push(b"GET /incompl");

        // never closed; the idle timeout is the only exit
        tokio::time::timeout(
            Duration::from_secs(1),
            tap(
                buffer,
                "example.com:443".to_owned(),
                sink.clone(),
                Duration::from_millis(50),
            ),
        )
        .await
        .unwrap();

        assert!(sink.records.lock().unwrap().is_empty());
    }
}
