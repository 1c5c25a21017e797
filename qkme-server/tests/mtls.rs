//! End-to-end requests over mutual TLS

use qkme_core::auth::{fingerprint, RegistryFile};
use qkme_core::*;
use qkme_server::config::TlsSettings;
use qkme_server::{build_state, tls, KmeConfig, KmeServer};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{PrivatePkcs8KeyDer, ServerName};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

const MASTER: &str = "MMMMMMMMMMMMMMMM";

struct Pki {
    ca: Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca = params.self_signed(&ca_key).unwrap();
        Pki { ca, ca_key }
    }

    fn issue(&self, common_name: &str, san: Vec<String>, usage: ExtendedKeyUsagePurpose) -> (Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(san).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        (cert, key)
    }

    fn client(&self, sae_id: &str) -> (Certificate, KeyPair) {
        self.issue(sae_id, Vec::new(), ExtendedKeyUsagePurpose::ClientAuth)
    }

    fn connector(&self, cert: &Certificate, key: &KeyPair) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.der().clone()).unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![cert.der().clone()],
                PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
            )
            .unwrap();
        TlsConnector::from(Arc::new(config))
    }
}

fn write(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

async fn start(pki: &Pki, dir: &Path, registered: &[(&str, &Certificate)]) -> SocketAddr {
    let (server_cert, server_key) = pki.issue(
        "qkme",
        vec!["localhost".to_string()],
        ExtendedKeyUsagePurpose::ServerAuth,
    );

    let registry = RegistryFile {
        saes: registered
            .iter()
            .map(|(id, cert)| SaeIdentity {
                sae_id: SaeId::new(id).unwrap(),
                fingerprint: fingerprint(cert.der().as_ref()),
                status: SaeStatus::Active,
                limits: SaeLimits::default(),
            })
            .collect(),
    };

    let mut config = KmeConfig::default();
    config.registry = write(dir, "registry.json", serde_json::to_vec(&registry).unwrap());
    config.pool.max_key_count = 8;
    let tls_settings = TlsSettings {
        cert: write(dir, "server.crt", server_cert.pem()),
        key: write(dir, "server.key", server_key.serialize_pem()),
        client_ca: write(dir, "ca.crt", pki.ca.pem()),
    };

    let state = build_state(&config).unwrap();
    state.engine.manager().replenish().await.unwrap();
    let server = KmeServer::new(state, tls::acceptor(&tls_settings).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

async fn get(connector: &TlsConnector, addr: SocketAddr, path: &str) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn registered_certificate_reaches_status() {
    let temp = tempfile::tempdir().unwrap();
    let pki = Pki::new();
    let (cert, key) = pki.client(MASTER);
    let addr = start(&pki, temp.path(), &[(MASTER, &cert)]).await;

    let response = get(
        &pki.connector(&cert, &key),
        addr,
        "/api/v1/keys/SSSSSSSSSSSSSSSS/status",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#""master_SAE_ID":"MMMMMMMMMMMMMMMM""#));
    assert!(response.contains(r#""stored_key_count":8"#));
}

#[tokio::test]
async fn unregistered_certificate_gets_401() {
    let temp = tempfile::tempdir().unwrap();
    let pki = Pki::new();
    let (registered, _) = pki.client(MASTER);
    let addr = start(&pki, temp.path(), &[(MASTER, &registered)]).await;

    // Same SAE_ID, different certificate: the fingerprint does not match
    let (impostor, impostor_key) = pki.client(MASTER);
    let response = get(
        &pki.connector(&impostor, &impostor_key),
        addr,
        "/api/v1/keys/SSSSSSSSSSSSSSSS/status",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 401"), "{}", response);

    // Health needs no identity
    let response = get(&pki.connector(&impostor, &impostor_key), addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
}
