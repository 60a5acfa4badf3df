//! 集成测试共享工具：会话间搬运密文、驱动握手、生成自签名 `rustls` 配置。

#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use spark_tls_session::{SessionError, Session, TlsEngine};

/// 把 `from` 的全部待写密文按 `chunk` 字节分段喂给 `to`。
pub fn shuttle<E: TlsEngine>(
    from: &mut Session<E>,
    to: &mut Session<E>,
    chunk: usize,
) -> Result<usize, SessionError> {
    let ciphertext = from.take_ciphertext();
    for piece in ciphertext.chunks(chunk.max(1)) {
        to.on_ciphertext_received(piece)?;
    }
    Ok(ciphertext.len())
}

/// 驱动双方握手直到都进入已建立状态。
pub fn complete_handshake<E: TlsEngine>(
    client: &mut Session<E>,
    server: &mut Session<E>,
    chunk: usize,
) -> Result<(), SessionError> {
    client.drive_handshake()?;
    for _ in 0..32 {
        let moved = shuttle(client, server, chunk)? + shuttle(server, client, chunk)?;
        if client.is_established() && server.is_established() && moved == 0 {
            return Ok(());
        }
    }
    panic!("handshake did not converge");
}

/// 自签名证书与私钥（DER 与 PEM 两种形态）。
pub struct Identity {
    pub certificate: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub certificate_pem: String,
    pub key_pem: String,
}

pub fn identity(host: &str) -> Identity {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec![host.to_owned()]).expect("self-signed certificate");
    Identity {
        certificate: cert.der().clone(),
        key_der: key_pair.serialize_der(),
        certificate_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

pub fn server_config(identity: &Identity, alpn: &[&[u8]]) -> ServerConfig {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.clone()));
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![identity.certificate.clone()], key)
        .expect("server config");
    config.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();
    config
}

pub fn client_config(identity: &Identity, alpn: &[&[u8]]) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots
        .add(identity.certificate.clone())
        .expect("trust anchor");
    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();
    config
}

pub fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_owned()).expect("server name")
}
