//! Re-sends previously captured requests.

use http::Response;
use hyper::body::Incoming;

use crate::{
    codec::{
        self,
        RebuildError,
    },
    forward::{
        self,
        Forward,
    },
    record::CapturedRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to rebuild request")]
    Rebuild(#[from] RebuildError),

    #[error("failed to send request")]
    Forward(#[from] forward::Error),
}

/// Rebuilds a [`CapturedRequest`] into a live request and dispatches it.
#[derive(Clone, Debug)]
pub struct Replayer {
    forward: Forward,
}

impl Replayer {
    pub fn new(forward: Forward) -> Self {
        Self { forward }
    }

    pub async fn replay(&self, record: &CapturedRequest) -> Result<Response<Incoming>, Error> {
        let request = codec::to_live(record)?;
        Ok(self.forward.send(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpListener,
    };

    use super::*;
    use crate::{
        record::Scheme,
        tls,
    };

    #[tokio::test]
    async fn stored_records_replay_against_a_live_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let origin = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\npong")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let record = CapturedRequest {
            method: "GET".to_owned(),
            scheme: Scheme::Http,
            host: address.to_string(),
            ..Default::default()
        };

        let replayer = Replayer::new(Forward::with_tls_config(tls::client_config_with_roots(
            Arc::new(rustls::RootCertStore::empty()),
        )));
        let response = replayer.replay(&record).await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");

        let seen = origin.await.unwrap();
        assert!(seen.starts_with("GET / HTTP/1.1\r\n"), "{seen}");
    }

    #[tokio::test]
    async fn invalid_records_fail_before_any_network_io() {
        let record = CapturedRequest {
            method: "not a method".to_owned(),
            scheme: Scheme::Http,
            host: "example.com".to_owned(),
            ..Default::default()
        };

        let replayer = Replayer::new(Forward::with_tls_config(tls::client_config_with_roots(
            Arc::new(rustls::RootCertStore::empty()),
        )));
        assert!(matches!(
            replayer.replay(&record).await,
            Err(Error::Rebuild(_))
        ));
    }
}
