//! TLS plumbing for interception: accepting intercepted clients with
//! on-demand leaf certificates and connecting onward as a TLS client.

use std::{
    fmt::Debug,
    net::IpAddr,
    num::NonZeroUsize,
    str::FromStr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use lru::LruCache;
use rcgen::KeyPair;
use rustls::{
    pki_types::{
        CertificateDer,
        PrivateKeyDer,
        ServerName,
    },
    server::Acceptor,
    ClientConfig,
    RootCertStore,
    ServerConfig,
};
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
    },
    sync::Mutex,
};
use tokio_rustls::{
    LazyConfigAcceptor,
    TlsConnector,
};

use crate::ca::Ca;

/// How many issued leaf certificates are kept around.
const LEAF_CACHE_CAPACITY: usize = 256;

/// How long a cached leaf certificate is reused before it is reissued.
const LEAF_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

pub type ClientStream<S> = tokio_rustls::client::TlsStream<S>;
pub type ServerStream<S> = tokio_rustls::server::TlsStream<S>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("rustls error")]
    Rustls(#[from] rustls::Error),

    #[error("ca error")]
    Ca(#[from] crate::ca::Error),

    #[error("invalid server name: {hostname}")]
    InvalidServerName { hostname: String },
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            _ => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

struct CachedLeaf {
    cert: CertificateDer<'static>,
    issued_at: Instant,
}

/// Shared TLS state for intercepted connections.
///
/// The server side impersonates whatever name the client asked for, with a
/// leaf certificate issued by the [`Ca`] and a single shared server key. The
/// client side connects onward with the given root store.
#[derive(Clone)]
pub struct Context {
    client_config: Arc<ClientConfig>,
    ca: Ca,
    server_key: Arc<KeyPair>,
    leaf_cache: Arc<Mutex<LruCache<String, CachedLeaf>>>,
    leaf_ttl: Duration,
}

impl Context {
    /// Creates a context that trusts the native root certificates for its
    /// onward connections.
    pub async fn new(ca: Ca) -> Result<Self, Error> {
        let roots = root_certificates()?;
        Self::with_roots(ca, roots).await
    }

    /// Creates a context with an explicit root store for onward connections.
    pub async fn with_roots(ca: Ca, roots: Arc<RootCertStore>) -> Result<Self, Error> {
        let client_config = client_config_with_roots(roots);

        let server_key =
            tokio::task::spawn_blocking(|| Ok::<_, crate::ca::Error>(Arc::new(KeyPair::generate()?)))
                .await
                .unwrap()?;

        let cache_capacity = NonZeroUsize::new(LEAF_CACHE_CAPACITY).unwrap();

        Ok(Self {
            client_config,
            ca,
            server_key,
            leaf_cache: Arc::new(Mutex::new(LruCache::new(cache_capacity))),
            leaf_ttl: LEAF_CACHE_TTL,
        })
    }

    /// Opens a TLS client connection to `host` over `stream`.
    pub async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        host: &str,
    ) -> Result<ClientStream<S>, Error> {
        let domain = server_name(host)?;
        let stream = TlsConnector::from(self.client_config.clone())
            .connect(domain, stream)
            .await?;
        Ok(stream)
    }

    /// Accepts a TLS connection, impersonating the server the client asked
    /// for.
    ///
    /// The impersonated name is the SNI from the client hello; clients that
    /// don't send one (e.g. when connecting to an IP address) get a leaf for
    /// `fallback_name` instead.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        fallback_name: &str,
    ) -> Result<ServerStream<S>, Error> {
        let start_handshake = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

        let server_name = start_handshake
            .client_hello()
            .server_name()
            .unwrap_or(fallback_name)
            .to_owned();

        let leaf = self.leaf_for(&server_name).await?;

        let cert_chain = vec![leaf, CertificateDer::clone(self.ca.root_cert())];
        let server_key = PrivateKeyDer::try_from(self.server_key.serialize_der())
            .map_err(|e| rustls::Error::General(e.to_owned()))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, server_key)?;

        let stream = start_handshake
            .into_stream(Arc::new(server_config))
            .await?;

        Ok(stream)
    }

    async fn leaf_for(&self, server_name: &str) -> Result<CertificateDer<'static>, Error> {
        let mut cache = self.leaf_cache.lock().await;

        if let Some(leaf) = cache.get(server_name) {
            if leaf.issued_at.elapsed() < self.leaf_ttl {
                return Ok(leaf.cert.clone());
            }
            cache.pop(server_name);
        }

        let cert = self
            .ca
            .issue(self.server_key.clone(), server_name)
            .await?;
        cache.put(
            server_name.to_owned(),
            CachedLeaf {
                cert: cert.clone(),
                issued_at: Instant::now(),
            },
        );

        Ok(cert)
    }

    pub fn root_cert(&self) -> &Arc<CertificateDer<'static>> {
        self.ca.root_cert()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("ca", &self.ca)
            .field("server_key", &self.server_key)
            .finish()
    }
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    match IpAddr::from_str(host) {
        Ok(ip_address) => Ok(ServerName::IpAddress(ip_address.into())),
        Err(_) => {
            ServerName::try_from(host.to_owned()).map_err(|_| {
                Error::InvalidServerName {
                    hostname: host.to_owned(),
                }
            })
        }
    }
}

pub fn client_config_with_roots(roots: Arc<RootCertStore>) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

pub fn client_config() -> Result<Arc<ClientConfig>, Error> {
    Ok(client_config_with_roots(root_certificates()?))
}

pub fn root_certificates() -> Result<Arc<RootCertStore>, Error> {
    static CERTS_CACHE: std::sync::Mutex<Option<Arc<RootCertStore>>> = std::sync::Mutex::new(None);
    let mut certs_cache = CERTS_CACHE.lock().unwrap();
    if let Some(certs) = &*certs_cache {
        Ok(certs.clone())
    }
    else {
        let mut certs = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs()? {
            certs.add(cert)?;
        }
        let certs = Arc::new(certs);
        *certs_cache = Some(certs.clone());
        Ok(certs)
    }
}
