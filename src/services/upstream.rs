//! 从公共结构库下载结构
//!
//! 支持 PDB（mmCIF 格式）和 PubChem（3D SDF 格式）。响应体按块写入
//! `PendingStructure`，超过单文件大小上限时立即中止，不会把整个响应读入内存。

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::infrastructure::config::UpstreamConfig;
use crate::storage::PendingStructure;

/// 远程结构来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSource {
    /// PDB ID，例如 `1ner`
    Pdb(String),
    /// PubChem CID，例如 `2244`
    PubChem(String),
}

impl RemoteSource {
    pub fn pdb(id: impl Into<String>) -> Result<Self> {
        let id = validate_id(id.into(), |c| c.is_ascii_alphanumeric())?;
        Ok(RemoteSource::Pdb(id.to_ascii_lowercase()))
    }

    pub fn pubchem(cid: impl Into<String>) -> Result<Self> {
        let cid = validate_id(cid.into(), |c| c.is_ascii_digit())?;
        Ok(RemoteSource::PubChem(cid))
    }

    pub fn id(&self) -> &str {
        match self {
            RemoteSource::Pdb(id) | RemoteSource::PubChem(id) => id,
        }
    }

    /// 本地保存时使用的文件名
    pub fn filename(&self) -> String {
        match self {
            RemoteSource::Pdb(id) => format!("{}.cif", id),
            RemoteSource::PubChem(cid) => format!("{}.sdf", cid),
        }
    }

    /// 统计日志中的端点名称
    pub fn endpoint(&self) -> &'static str {
        match self {
            RemoteSource::Pdb(_) => "pdb_id",
            RemoteSource::PubChem(_) => "pubchem_cid",
        }
    }
}

fn validate_id(id: String, allowed: impl Fn(char) -> bool) -> Result<String> {
    let id = id.trim().to_string();
    if id.is_empty() || id.len() > 32 || !id.chars().all(allowed) {
        return Err(AppError::upstream(
            None,
            format!("Invalid identifier {:?}.", id),
        ));
    }
    Ok(id)
}

/// 结构下载接口
#[async_trait]
pub trait StructureFetcher: Send + Sync {
    /// 把远程结构写入 `sink`
    ///
    /// 远程返回非成功状态时返回 `UpstreamFetch`，超过大小上限时返回 `FileTooLarge`
    async fn fetch(&self, source: &RemoteSource, sink: &mut PendingStructure) -> Result<()>;
}

/// 基于 reqwest 的 HTTP 下载实现
pub struct HttpStructureFetcher {
    client: reqwest::Client,
    pdb_url: String,
    pubchem_url: String,
}

impl HttpStructureFetcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("acc2-api/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            pdb_url: config.pdb_url.clone(),
            pubchem_url: config.pubchem_url.clone(),
        })
    }

    pub fn url_for(&self, source: &RemoteSource) -> String {
        let template = match source {
            RemoteSource::Pdb(_) => &self.pdb_url,
            RemoteSource::PubChem(_) => &self.pubchem_url,
        };
        template.replace("{id}", source.id())
    }
}

#[async_trait]
impl StructureFetcher for HttpStructureFetcher {
    async fn fetch(&self, source: &RemoteSource, sink: &mut PendingStructure) -> Result<()> {
        let url = self.url_for(source);
        debug!(url = %url, "Fetching structure");

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::upstream(None, format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "Upstream returned an error");
            return Err(AppError::upstream(
                Some(status.as_u16()),
                format!("{} for url: {}", status, url),
            ));
        }

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::upstream(None, format!("Reading {} failed: {}", url, e)))?
        {
            sink.write_chunk(&chunk)?;
        }

        debug!(url = %url, bytes = sink.written(), "Structure fetched");
        Ok(())
    }
}
