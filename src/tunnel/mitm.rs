use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ServerConfig, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use super::BoxedStream;
use crate::config::MitmConfig;
use crate::error::{GofwError, Result};

const CA_COMMON_NAME: &str = "gofw interception CA";
pub const DEFAULT_LEAF_CACHE_SIZE: usize = 256;

/// Signs per-host leaf certificates for intercepted TLS sessions.
pub struct CertificateAuthority {
    ca: Certificate,
    ca_der: Vec<u8>,
    /// Minted leaves by lowercase host, least recently used evicted first.
    leaves: Mutex<LruCache<String, Arc<ServerConfig>>>,
    client: Arc<ClientConfig>,
}

impl CertificateAuthority {
    /// Fresh ECDSA P-256 authority that lives as long as the process.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];

        let ca = Certificate::from_params(params)?;
        let ca_der = ca.serialize_der()?;
        Self::with_certificate(ca, ca_der)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key)?;
        let ca_der = pem_to_der(cert_pem)?;
        let ca = Certificate::from_params(params)?;
        Self::with_certificate(ca, ca_der)
    }

    /// Loads the configured CA files, or generates an authority when none are set.
    pub fn from_config(config: &MitmConfig) -> Result<Self> {
        let ca = match (&config.ca_cert, &config.ca_key) {
            (Some(cert_path), Some(key_path)) => {
                let read = |path: &std::path::Path| {
                    std::fs::read_to_string(path)
                        .map_err(|e| GofwError::config(format!("cannot read {}: {}", path.display(), e)))
                };
                Self::from_pem(&read(cert_path)?, &read(key_path)?)
                    .map_err(|e| GofwError::config(format!("invalid MITM CA: {}", e)))?
            }
            _ => Self::generate()?,
        };
        Ok(ca.with_leaf_capacity(config.leaf_cache_size))
    }

    /// Caps how many minted leaves are kept; 0 falls back to the default.
    pub fn with_leaf_capacity(self, capacity: usize) -> Self {
        *self.leaves.lock() = LruCache::new(leaf_capacity(capacity));
        self
    }

    fn with_certificate(ca: Certificate, ca_der: Vec<u8>) -> Result<Self> {
        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        Ok(Self {
            ca,
            ca_der,
            leaves: Mutex::new(LruCache::new(leaf_capacity(DEFAULT_LEAF_CACHE_SIZE))),
            client: Arc::new(client),
        })
    }

    pub fn ca_der(&self) -> &[u8] {
        &self.ca_der
    }

    pub fn cached_hosts(&self) -> usize {
        self.leaves.lock().len()
    }

    /// TLS server config presenting a leaf for `host`, minted on first use.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        if let Some(config) = self.leaves.lock().get(&host) {
            return Ok(config.clone());
        }

        let mut params = CertificateParams::new(vec![host.clone()]);
        params.distinguished_name.push(DnType::CommonName, host.as_str());
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        let leaf = Certificate::from_params(params)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.ca)?;
        let key_der = leaf.serialize_private_key_der();

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(leaf_der), rustls::Certificate(self.ca_der.clone())],
                rustls::PrivateKey(key_der),
            )?;
        let config = Arc::new(config);

        log::debug!("minted interception certificate for {}", host);
        self.leaves.lock().put(host, config.clone());
        Ok(config)
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }
}

fn leaf_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity)
        .or(NonZeroUsize::new(DEFAULT_LEAF_CACHE_SIZE))
        .unwrap_or(NonZeroUsize::MIN)
}

/// Terminates the client's TLS with a leaf for `host`, then opens TLS to the
/// destination over `outbound`.
pub async fn intercept(
    ca: &CertificateAuthority,
    client_stream: TcpStream,
    outbound: BoxedStream,
    host: &str,
) -> Result<(server::TlsStream<TcpStream>, client::TlsStream<BoxedStream>)> {
    let acceptor = TlsAcceptor::from(ca.server_config(host)?);
    let inbound = acceptor
        .accept(client_stream)
        .await
        .map_err(|e| GofwError::Tls(format!("client handshake for {} failed: {}", host, e)))?;

    let server_name = ServerName::try_from(host).map_err(|_| GofwError::Tls(format!("invalid server name {}", host)))?;
    let connector = TlsConnector::from(ca.client_config());
    let outbound = connector
        .connect(server_name, outbound)
        .await
        .map_err(|e| GofwError::Tls(format!("destination handshake for {} failed: {}", host, e)))?;

    Ok((inbound, outbound))
}

/// The destination leg of an intercepted session is not verified.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("-----BEGIN CERTIFICATE-----"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END"))
        .collect();
    if body.is_empty() {
        return Err(GofwError::config("no certificate in PEM input"));
    }
    STANDARD
        .decode(body)
        .map_err(|e| GofwError::config(format!("invalid certificate PEM: {}", e)))
}
