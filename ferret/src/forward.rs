//! Dispatches a single request to its origin server.

use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use http::{
    header,
    uri::Scheme as UriScheme,
    Request,
    Response,
    Uri,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
    },
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::tls;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("hyper error")]
    Hyper(#[from] hyper::Error),

    #[error("http error")]
    Http(#[from] http::Error),

    #[error("tls error")]
    Tls(#[from] tls::Error),

    #[error("request has no host")]
    NoHost,

    #[error("timed out connecting to {host}")]
    DialTimeout { host: String },

    #[error("timed out waiting for a response from {host}")]
    RequestTimeout { host: String },
}

/// An HTTP/1.x client that opens one connection per request.
///
/// Requests carry an absolute URI; the scheme decides whether the connection
/// is wrapped in TLS.
#[derive(Clone)]
pub struct Forward {
    tls: Arc<ClientConfig>,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl Forward {
    /// Creates a forwarder that trusts the native root certificates.
    pub fn new() -> Result<Self, tls::Error> {
        Ok(Self::with_tls_config(tls::client_config()?))
    }

    pub fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
        Self {
            tls,
            dial_timeout: DIAL_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Sends `request` to the host in its URI and returns the streaming
    /// response.
    pub async fn send(
        &self,
        mut request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, Error> {
        let uri = request.uri().clone();
        let https = uri.scheme() == Some(&UriScheme::HTTPS);
        let authority = uri.authority().ok_or(Error::NoHost)?;
        let host = authority.host().to_owned();
        let port = authority
            .port_u16()
            .unwrap_or(if https { 443 } else { 80 });
        let address = format!("{host}:{port}");

        // conn-level hyper wants an origin-form request target
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        *request.uri_mut() = Uri::try_from(path_and_query)
            .unwrap_or_else(|_| Uri::from_static("/"));

        if !request.headers().contains_key(header::HOST) {
            let host_value = authority
                .as_str()
                .rsplit('@')
                .next()
                .unwrap_or(authority.as_str())
                .to_owned();
            request
                .headers_mut()
                .insert(header::HOST, host_value.parse().map_err(http::Error::from)?);
        }

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                Error::DialTimeout {
                    host: address.clone(),
                }
            })??;

        if https {
            let domain = tls::server_name(&host)?;
            let stream = TlsConnector::from(self.tls.clone())
                .connect(domain, stream)
                .await?;
            self.exchange(stream, request, &address).await
        }
        else {
            self.exchange(stream, request, &address).await
        }
    }

    async fn exchange<S>(
        &self,
        stream: S,
        request: Request<Full<Bytes>>,
        address: &str,
    ) -> Result<Response<Incoming>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut send_request, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%error, "origin connection ended with an error");
            }
        });

        let response = tokio::time::timeout(self.request_timeout, send_request.send_request(request))
            .await
            .map_err(|_| {
                Error::RequestTimeout {
                    host: address.to_owned(),
                }
            })??;

        Ok(response)
    }
}

impl std::fmt::Debug for Forward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forward")
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
