//! 会话与 TLS 配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - [`SessionConfig`] 收拢会话泵的块大小与引擎缓存上限，宿主可在 TOML 中按部署调优；
//! - [`TlsSettings`] 描述证书、信任锚与协议下限，并能一次性装配出可热更的 [`RustlsContext`]。
//!
//! ## 契约（What）
//! - 所有字段都有默认值，空 TOML 文档即得到默认配置；未知字段直接拒绝，避免拼写错误被静默忽略；
//! - `min_protocol_version` 取 `"tls12"`（默认，同时启用 1.2 与 1.3）或 `"tls13"`；
//! - 服务端身份需要同时给出 `cert_chain_path` 与 `private_key_path`；客户端需要 `ca_cert_path` 与 `server_name`。
//!
//! ## 风险与权衡（Trade-offs）
//! - 私钥以 PEM 文件加载，文件权限由部署方负责；
//! - 证书链与私钥是否匹配由 `rustls` 在装配时校验，错误以 [`SettingsError::Rustls`] 返回。

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion,
    crypto::CryptoProvider,
    pki_types::{
        CertificateDer, PrivateKeyDer, ServerName,
        pem::{self, PemObject},
    },
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{engine::ConduitLimits, rustls_engine::RustlsContext};

const DEFAULT_READ_CHUNK: usize = 16 * 1024;
const DEFAULT_DRAIN_CHUNK: usize = 4 * 1024;
const DEFAULT_ENGINE_BUFFER_LIMIT: usize = 64 * 1024;
/// 引擎缓存上限的下限，更小的配置值按此处理。
pub const MIN_ENGINE_BUFFER_LIMIT: usize = 1024;

/// 会话泵参数。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// 单次解密与单次传输读取的块大小。
    pub read_chunk: usize,
    /// 排空出站导管时的块大小。
    pub drain_chunk: usize,
    /// 引擎内部缓存上限；达到上限时加密泵报告背压。低于 [`MIN_ENGINE_BUFFER_LIMIT`] 的值按下限处理。
    pub engine_buffer_limit: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            drain_chunk: DEFAULT_DRAIN_CHUNK,
            engine_buffer_limit: Some(DEFAULT_ENGINE_BUFFER_LIMIT),
        }
    }
}

impl SessionConfig {
    pub fn conduit_limits(&self) -> ConduitLimits {
        ConduitLimits {
            engine_buffer_limit: self.engine_buffer_limit,
        }
    }

    /// 块大小至少为 1，引擎缓存上限至少为 [`MIN_ENGINE_BUFFER_LIMIT`]，否则泵无法前进。
    pub(crate) fn normalized(mut self) -> Self {
        self.read_chunk = self.read_chunk.max(1);
        self.drain_chunk = self.drain_chunk.max(1);
        self.engine_buffer_limit = self
            .engine_buffer_limit
            .map(|limit| limit.max(MIN_ENGINE_BUFFER_LIMIT));
        self
    }

    pub(crate) fn scratch_len(&self) -> usize {
        self.read_chunk.max(self.drain_chunk)
    }
}

/// 协商允许的最低 TLS 版本。
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFloor {
    #[default]
    Tls12,
    Tls13,
}

static TLS12_AND_UP: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl ProtocolFloor {
    pub fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            ProtocolFloor::Tls12 => TLS12_AND_UP,
            ProtocolFloor::Tls13 => TLS13_ONLY,
        }
    }
}

/// 配置装载与装配错误。
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing setting `{0}`")]
    Missing(&'static str),
    #[error("failed to load pem file {}: {source}", .path.display())]
    Pem { path: PathBuf, source: pem::Error },
    #[error("no certificates found in {}", .path.display())]
    EmptyCertificateChain { path: PathBuf },
    #[error("invalid server name `{name}`")]
    InvalidServerName { name: String },
    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("settings configure neither a server identity nor client trust anchors")]
    Incomplete,
}

impl SettingsError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SettingsError::Read { .. } => "spark.tls.settings.read",
            SettingsError::Parse(_) => "spark.tls.settings.parse",
            SettingsError::Missing(_) => "spark.tls.settings.missing",
            SettingsError::Pem { .. } | SettingsError::EmptyCertificateChain { .. } => {
                "spark.tls.settings.pem"
            }
            SettingsError::InvalidServerName { .. } => "spark.tls.settings.server_name",
            SettingsError::Rustls(_) => "spark.tls.settings.rustls",
            SettingsError::Incomplete => "spark.tls.settings.incomplete",
        }
    }
}

/// TLS 部署配置。
///
/// ```toml
/// cert_chain_path = "/etc/spark/tls/chain.pem"
/// private_key_path = "/etc/spark/tls/key.pem"
/// min_protocol_version = "tls13"
/// alpn_protocols = ["h2", "http/1.1"]
///
/// [session]
/// read_chunk = 8192
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    pub cert_chain_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub server_name: Option<String>,
    pub min_protocol_version: ProtocolFloor,
    pub alpn_protocols: Vec<String>,
    pub session: SessionConfig,
}

impl TlsSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 装配服务端配置。
    pub fn server_config(&self) -> Result<ServerConfig, SettingsError> {
        let chain_path = self
            .cert_chain_path
            .as_deref()
            .ok_or(SettingsError::Missing("cert_chain_path"))?;
        let key_path = self
            .private_key_path
            .as_deref()
            .ok_or(SettingsError::Missing("private_key_path"))?;

        let chain = load_certificates(chain_path)?;
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(|source| SettingsError::Pem {
            path: key_path.to_path_buf(),
            source,
        })?;

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(self.min_protocol_version.versions())?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = self.alpn();
        Ok(config)
    }

    /// 装配客户端配置，信任锚取自 `ca_cert_path`。
    pub fn client_config(&self) -> Result<ClientConfig, SettingsError> {
        let ca_path = self
            .ca_cert_path
            .as_deref()
            .ok_or(SettingsError::Missing("ca_cert_path"))?;

        let mut roots = RootCertStore::empty();
        for certificate in load_certificates(ca_path)? {
            roots.add(certificate)?;
        }

        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(self.min_protocol_version.versions())?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = self.alpn();
        Ok(config)
    }

    /// 客户端校验对端证书时使用的名称。
    pub fn server_name(&self) -> Result<ServerName<'static>, SettingsError> {
        let name = self
            .server_name
            .as_deref()
            .ok_or(SettingsError::Missing("server_name"))?;
        ServerName::try_from(name.to_owned()).map_err(|_| SettingsError::InvalidServerName {
            name: name.to_owned(),
        })
    }

    /// 按已配置的部分装配上下文：给出服务端身份则装入服务端配置，给出信任锚则装入客户端配置。
    pub fn build_context(&self) -> Result<RustlsContext, SettingsError> {
        let wants_server = self.cert_chain_path.is_some() || self.private_key_path.is_some();
        let wants_client = self.ca_cert_path.is_some();
        if !wants_server && !wants_client {
            return Err(SettingsError::Incomplete);
        }

        let context = RustlsContext::empty();
        if wants_server {
            context.replace_server_config(Arc::new(self.server_config()?));
        }
        if wants_client {
            context.replace_client_config(Arc::new(self.client_config()?), self.server_name()?);
        }
        debug!(
            server = wants_server,
            client = wants_client,
            min_protocol_version = ?self.min_protocol_version,
            "tls context assembled"
        );
        Ok(context)
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect()
    }
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, SettingsError> {
    let pem_error = |source| SettingsError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let certificates = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certificates.is_empty() {
        return Err(SettingsError::EmptyCertificateChain {
            path: path.to_path_buf(),
        });
    }
    Ok(certificates)
}
