//! The intercepting forward proxy.
//!
//! Plain requests are captured and dispatched directly. `CONNECT` requests
//! open a tunnel in which the proxy terminates the client's TLS with an
//! impersonated certificate, re-encrypts towards the origin, and taps the
//! decrypted bytes for capture.

use std::{
    convert::Infallible,
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use http::{
    Method,
    Request,
    Response,
    StatusCode,
};
use http_body_util::{
    combinators::BoxBody,
    BodyExt,
    Full,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::{
    TcpListener,
    TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    capture,
    codec,
    forward::{
        self,
        Forward,
    },
    record::{
        RequestSink,
        Scheme,
    },
    tls,
    tunnel,
};

pub const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("hyper error")]
    Hyper(#[from] hyper::Error),
}

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full(message.to_owned()))
        .expect("constructed invalid http response")
}

/// The proxy server. Cloned per connection and per request.
#[derive(Clone)]
pub struct Proxy<S> {
    tls: tls::Context,
    forward: Forward,
    sink: S,
    idle_timeout: Duration,
}

impl<S: RequestSink> Proxy<S> {
    pub fn new(tls: tls::Context, forward: Forward, sink: S) -> Self {
        Self {
            tls,
            forward,
            sink,
            idle_timeout: capture::DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Sets how long a tunnel's capture tap waits on a partial request
    /// before giving up on it.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn serve(
        &self,
        bind_address: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(bind_address).await?;
        tracing::info!(address = %bind_address, "proxy listening");
        self.serve_on(listener, shutdown).await
    }

    /// Accepts connections from an already-bound listener until `shutdown`
    /// fires.
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, address) = result?;
                    let span = tracing::info_span!("proxy-connection", %address);
                    let proxy = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(
                        async move {
                            tokio::select! {
                                _ = proxy.handle_connection(stream) => {}
                                _ = shutdown.cancelled() => {}
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    async fn handle_connection(self, stream: TcpStream) {
        let service = hyper::service::service_fn(move |request| {
            let proxy = self.clone();
            async move { Ok::<_, Infallible>(proxy.handle_request(request).await) }
        });

        let result = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await;

        if let Err(error) = result {
            tracing::debug!(%error, "connection ended with an error");
        }
    }

    async fn handle_request(self, request: Request<Incoming>) -> Response<ProxyBody> {
        if request.method() == Method::CONNECT {
            self.handle_connect(request).await
        }
        else {
            self.handle_forward(request).await
        }
    }

    /// Establishes a tunnel: dials the origin, answers the `CONNECT` and
    /// takes over the connection once the client's HTTP layer lets go of
    /// it.
    async fn handle_connect(self, request: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = request.uri().authority().cloned()
        else {
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority");
        };

        let target = authority.to_string();
        let host = authority.host().to_owned();
        let port = authority.port_u16().unwrap_or(443);

        // dial before answering, so a dead origin fails the CONNECT itself
        let origin = match self.dial_origin(&host, port).await {
            Ok(origin) => origin,
            Err(error) => {
                tracing::warn!(%target, %error, "failed to reach tunnel target");
                return status_response(StatusCode::SERVICE_UNAVAILABLE, "failed to reach target");
            }
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(request).await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    tracing::debug!(%error, "connect upgrade failed");
                    return;
                }
            };

            let client = match self.tls.accept(TokioIo::new(upgraded), &host).await {
                Ok(client) => client,
                Err(error) => {
                    tracing::debug!(%target, %error, "client tls handshake failed");
                    return;
                }
            };

            tunnel::relay(client, origin, target, self.sink, self.idle_timeout).await;
        });

        status_response(StatusCode::OK, "")
    }

    async fn dial_origin(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tls::ClientStream<TcpStream>, forward::Error> {
        let address = format!("{host}:{port}");
        let stream = tokio::time::timeout(forward::DIAL_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| forward::Error::DialTimeout { host: address })??;

        Ok(self.tls.connect(stream, host).await?)
    }

    /// Captures and dispatches a plain (non-tunneled) request.
    async fn handle_forward(self, request: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = request.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                tracing::debug!(%error, "failed to read request body");
                return status_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        let record = codec::from_live(&parts, Scheme::Http, &body);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(error) = sink.save(record).await {
                tracing::warn!(%error, "failed to save captured request");
            }
        });

        let forward_request = Request::from_parts(parts, Full::new(body));
        match self.forward.send(forward_request).await {
            Ok(response) => response.map(BodyExt::boxed),
            Err(error) => {
                tracing::warn!(%error, "failed to forward request");
                status_response(StatusCode::SERVICE_UNAVAILABLE, "failed to forward request")
            }
        }
    }
}

impl<S> std::fmt::Debug for Proxy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("tls", &self.tls)
            .field("forward", &self.forward)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
