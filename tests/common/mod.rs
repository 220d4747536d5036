//! Shared fixtures for the proxy integration tests: an in-memory test
//! CA for TLS interception, loopback origins, and small wire helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tapwire::mitm::Mitm;
use tapwire::proxy::Proxy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// In-memory CA minting per-host leaf certificates on demand.
pub struct TestCa {
    ca_params: CertificateParams,
    ca_key: KeyPair,
    ca_cert_der: CertificateDer<'static>,
}

impl TestCa {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("tapwire test CA".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = params.clone().self_signed(&ca_key).unwrap();
        Self {
            ca_params: params,
            ca_key,
            ca_cert_der: ca_cert.der().clone(),
        }
    }

    pub fn ca_cert(&self) -> CertificateDer<'static> {
        self.ca_cert_der.clone()
    }

    /// Mint a leaf for `host` and build a server config around it.
    pub fn server_config(&self, host: &str) -> Arc<ServerConfig> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(host.try_into().unwrap())];

        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key);
        let leaf = params.signed_by(&leaf_key, &issuer).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone(), self.ca_cert_der.clone()], key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Client config trusting this CA.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert()).unwrap();
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}

/// MITM backend over [`TestCa`].
pub struct TestMitm {
    ca: TestCa,
}

impl TestMitm {
    pub fn new(ca: TestCa) -> Self {
        Self { ca }
    }
}

impl Mitm for TestMitm {
    fn server_config(&self, host: &str) -> Arc<ServerConfig> {
        self.ca.server_config(host)
    }
}

/// Bind the proxy on an ephemeral loopback port and serve it in the
/// background.
pub async fn start_proxy(proxy: Proxy) -> (SocketAddr, CancellationToken, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serve_token = shutdown.clone();
    let handle = tokio::spawn(async move {
        proxy.serve(listener, serve_token).await.unwrap();
    });
    (addr, shutdown, handle)
}

/// One-shot HTTP origin: accepts a single connection, reads one request
/// (headers plus `Content-Length` body), answers with `response`, and
/// reports the raw request it saw.
pub async fn spawn_origin(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let seen = read_http_request(&mut stream).await;
        let _ = tx.send(seen);
        stream.write_all(response).await.unwrap();
        let _ = stream.shutdown().await;
    });
    (addr, rx)
}

/// One-shot echo origin for tunnel tests: mirrors bytes until EOF.
pub async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = stream.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
    });
    addr
}

/// Read one request (header section plus `Content-Length` body) as raw
/// text.
pub async fn read_http_request<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let raw = read_until_blank_line(stream).await;
    let head = String::from_utf8_lossy(&raw).into_owned();
    let body_len = content_length_of(&head);
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        stream.read_exact(&mut body).await.unwrap();
    }
    format!("{}{}", head, String::from_utf8_lossy(&body))
}

/// Read one response: the header section as text plus a
/// `Content-Length`-framed body.
pub async fn read_http_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let raw = read_until_blank_line(stream).await;
    let head = String::from_utf8_lossy(&raw).into_owned();
    let body_len = content_length_of(&head);
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        stream.read_exact(&mut body).await.unwrap();
    }
    (head, body)
}

async fn read_until_blank_line<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    buf
}

fn content_length_of(head: &str) -> usize {
    head.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .next()
        .unwrap_or(0)
}

/// Open a client connection and send raw bytes.
pub async fn send_raw(addr: SocketAddr, data: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(data).await.unwrap();
    stream
}

/// Write a full request and collect the framed response over any stream.
pub async fn roundtrip_raw<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    data: &[u8],
) -> (String, Vec<u8>) {
    stream.write_all(data).await.unwrap();
    read_http_response(stream).await
}
