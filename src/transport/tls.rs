//! # TLS Transport Layer
//!
//! Optional TLS wrapping for controller/agent connections. The framed protocol
//! runs unchanged inside the TLS stream, so whole-message encryption and TLS can be
//! enabled independently.
//!
//! ## Responsibilities
//! - Build a `TlsAcceptor` from PEM certificate and PKCS8 key files
//! - Build a `TlsConnector` trusting the system roots plus an optional extra CA
//! - Offer an insecure client mode for development with self-signed certificates

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::config::TransportConfig;
use crate::error::{ChannelError, Result};

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
}

impl TlsServerConfig {
    /// Create a new TLS server configuration
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Server TLS settings from the transport section, None when TLS is off
    pub fn from_config(config: &TransportConfig) -> Result<Option<Self>> {
        if !config.tls_enabled {
            return Ok(None);
        }
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Ok(Some(Self::new(cert, key))),
            _ => Err(ChannelError::Config(
                "tls_cert_path and tls_key_path are required when TLS is enabled".into(),
            )),
        }
    }

    /// Generate a self-signed certificate for development/testing purposes
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;

        let key_file = File::open(&self.key_path)
            .map_err(|e| ChannelError::Tls(format!("Failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|_| ChannelError::Tls("Failed to parse private key".into()))?;
        if keys.is_empty() {
            return Err(ChannelError::Tls("No private keys found".into()));
        }
        let private_key = PrivateKey(keys.swap_remove(0));

        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ChannelError::Tls(format!("TLS error: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    ca_path: Option<String>,
}

impl TlsClientConfig {
    /// Create a new TLS client configuration
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            ca_path: None,
        }
    }

    /// Client TLS settings from the transport section, None when TLS is off
    pub fn from_config(config: &TransportConfig) -> Option<Self> {
        if !config.tls_enabled {
            return None;
        }
        let mut tls = Self::new(config.server_name.clone());
        if let Some(ca) = &config.tls_ca_path {
            tls = tls.with_ca_file(ca.clone());
        }
        if config.tls_insecure {
            tls = tls.insecure();
        }
        Some(tls)
    }

    /// Trust an additional CA certificate (PEM)
    pub fn with_ca_file<S: Into<String>>(mut self, path: S) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Skip certificate verification entirely.
    ///
    /// Only for development against self-signed certificates.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Load the TLS client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        if self.insecure {
            struct AcceptAnyServerCert;

            impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
                fn verify_server_cert(
                    &self,
                    _end_entity: &Certificate,
                    _intermediates: &[Certificate],
                    _server_name: &ServerName,
                    _scts: &mut dyn Iterator<Item = &[u8]>,
                    _ocsp_response: &[u8],
                    _now: std::time::SystemTime,
                ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error>
                {
                    Ok(rustls::client::ServerCertVerified::assertion())
                }
            }

            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth());
        }

        let mut root_store = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(native) => {
                for cert in native {
                    if let Err(e) = root_store.add(&Certificate(cert.0)) {
                        debug!(error = %e, "Skipping unusable system certificate");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to load system certificates"),
        }
        if let Some(ca_path) = &self.ca_path {
            for cert in load_certs(ca_path)? {
                root_store
                    .add(&cert)
                    .map_err(|e| ChannelError::Tls(format!("Failed to add CA cert: {e}")))?;
            }
        }

        Ok(builder
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ChannelError::Tls("Invalid server name".into()))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ChannelError::Tls(format!("Failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ChannelError::Tls("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ChannelError::Tls(format!("No certificates in {path}")));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Wrap an established TCP stream in TLS
#[instrument(skip(stream, config), fields(server_name = %config.server_name))]
pub async fn connect(
    stream: TcpStream,
    config: &TlsClientConfig,
) -> Result<ClientTlsStream<TcpStream>> {
    let connector = config.connector()?;
    let domain = config.server_name()?;
    connector
        .connect(domain, stream)
        .await
        .map_err(|e| ChannelError::Tls(format!("TLS connection failed: {e}")))
}
