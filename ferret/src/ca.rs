//! The interception root CA and on-demand leaf issuance.

use std::{
    fmt::Debug,
    fs::File,
    io::BufReader,
    net::IpAddr,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    sync::Arc,
};

use rcgen::{
    BasicConstraints,
    Certificate,
    CertificateParams,
    DistinguishedName,
    DnType,
    IsCa,
    KeyPair,
    KeyUsagePurpose,
    SanType,
};
use rustls::pki_types::CertificateDer;
use time::{
    Duration,
    OffsetDateTime,
};

/// How long before now a leaf certificate becomes valid. Covers clients with
/// a skewed clock.
const LEAF_NOT_BEFORE: Duration = Duration::hours(1);

/// How long a leaf certificate stays valid.
const LEAF_NOT_AFTER: Duration = Duration::days(90);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("rcgen error")]
    Rcgen(#[from] rcgen::Error),

    #[error("missing certificate: {path}")]
    NoCertificate { path: PathBuf },

    #[error("invalid server name: {hostname}")]
    InvalidServerName { hostname: String },
}

/// The root certificate authority used to impersonate intercepted servers.
///
/// Clients that want to connect through the intercepting proxy without
/// certificate errors install the root certificate ([`Ca::save`] writes it
/// out as PEM).
#[derive(Clone)]
pub struct Ca {
    key_pair: Arc<KeyPair>,
    cert: Arc<CertificateDer<'static>>,
    cert_for_signing: Arc<Certificate>,
}

impl Ca {
    pub fn open(key_file: impl AsRef<Path>, cert_file: impl AsRef<Path>) -> Result<Self, Error> {
        let key_pair = Arc::new(KeyPair::from_pem(&std::fs::read_to_string(key_file)?)?);

        let cert_file = cert_file.as_ref();
        let mut reader = BufReader::new(File::open(cert_file)?);
        let cert = Arc::new(rustls_pemfile::certs(&mut reader).next().ok_or_else(
            move || {
                Error::NoCertificate {
                    path: cert_file.to_owned(),
                }
            },
        )??);

        // see https://github.com/rustls/rcgen/issues/268
        let cert_params = CertificateParams::from_ca_cert_der(&cert)?;
        let cert_for_signing = Arc::new(cert_params.self_signed(&key_pair)?);

        Ok(Self {
            key_pair,
            cert,
            cert_for_signing,
        })
    }

    pub async fn generate() -> Result<Self, Error> {
        let mut cert_params = CertificateParams::default();
        cert_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        cert_params.distinguished_name = DistinguishedName::new();
        cert_params
            .distinguished_name
            .push(DnType::CommonName, "ferret root ca");
        cert_params
            .distinguished_name
            .push(DnType::OrganizationName, "ferret");
        cert_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        cert_params
            .key_usages
            .push(KeyUsagePurpose::DigitalSignature);

        let (key_pair, cert_for_signing) = tokio::task::spawn_blocking(move || {
            let key_pair = Arc::new(KeyPair::generate()?);
            let cert_for_signing = Arc::new(cert_params.self_signed(&key_pair)?);
            Ok::<_, Error>((key_pair, cert_for_signing))
        })
        .await
        .unwrap()?;

        Ok(Self {
            key_pair,
            cert: Arc::new(cert_for_signing.der().to_owned()),
            cert_for_signing,
        })
    }

    pub fn save(
        &self,
        key_file: impl AsRef<Path>,
        cert_file: impl AsRef<Path>,
    ) -> Result<(), Error> {
        std::fs::write(key_file, self.key_pair.serialize_pem())?;
        std::fs::write(cert_file, self.cert_for_signing.pem())?;
        Ok(())
    }

    /// Issues a leaf certificate for `server_name`, signed by this CA.
    ///
    /// `server_name` may be a DNS name or an IP address; the subject
    /// alternative name is set accordingly. Signing happens on a blocking
    /// thread.
    pub async fn issue(
        &self,
        server_key: Arc<KeyPair>,
        server_name: &str,
    ) -> Result<CertificateDer<'static>, Error> {
        let mut cert_params = CertificateParams::default();
        cert_params.distinguished_name = DistinguishedName::new();
        cert_params
            .distinguished_name
            .push(DnType::CommonName, server_name);

        let san = match IpAddr::from_str(server_name) {
            Ok(ip_address) => SanType::IpAddress(ip_address),
            Err(_) => {
                SanType::DnsName(server_name.to_owned().try_into().map_err(|_| {
                    Error::InvalidServerName {
                        hostname: server_name.to_owned(),
                    }
                })?)
            }
        };
        cert_params.subject_alt_names.push(san);

        let now = OffsetDateTime::now_utc();
        cert_params.not_before = now - LEAF_NOT_BEFORE;
        cert_params.not_after = now + LEAF_NOT_AFTER;

        let ca_key = self.key_pair.clone();
        let ca_cert = self.cert_for_signing.clone();

        let server_cert = tokio::task::spawn_blocking(move || {
            cert_params.signed_by(&*server_key, &ca_cert, &ca_key)
        })
        .await
        .unwrap()?;

        Ok(server_cert.into())
    }

    pub fn root_cert(&self) -> &Arc<CertificateDer<'static>> {
        &self.cert
    }
}

impl Debug for Ca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ca")
            .field("key_pair", &self.key_pair)
            .field("cert", &self.cert)
            .finish()
    }
}
