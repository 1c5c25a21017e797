//! Mutual TLS setup: SAEs must present a certificate issued by a configured CA

use crate::config::TlsSettings;
use anyhow::{bail, Context};
use qkme_core::auth::PeerCertificate;
use qkme_core::KmeError;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load every certificate from a PEM file
pub fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = CertificateDer::pem_reader_iter(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;

    if certs.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Load a PKCS#1, PKCS#8 or SEC1 private key from a PEM file
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(&mut reader)
        .with_context(|| format!("Failed to parse private key in {}", path.display()))
}

/// Build a TLS 1.2+ server config that requires a client certificate
pub fn server_config(settings: &TlsSettings) -> anyhow::Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = load_certificates(&settings.cert)?;
    let key = load_private_key(&settings.key)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certificates(&settings.client_ca)? {
        roots.add(ca).context("Failed to add client CA certificate")?;
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("Failed to build client certificate verifier")?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("Unsupported TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("Server certificate and key do not match")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

pub fn acceptor(settings: &TlsSettings) -> anyhow::Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(settings)?)))
}

/// The leaf certificate the client presented during the handshake
pub fn peer_certificate(conn: &ServerConnection) -> qkme_core::Result<PeerCertificate> {
    let leaf = conn
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| KmeError::Authentication("no client certificate presented".to_string()))?;

    PeerCertificate::from_der(leaf.as_ref())
}
