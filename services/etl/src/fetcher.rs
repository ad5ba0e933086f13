//! Source fetcher: downloads spreadsheets and keeps a local byte cache.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{Config, SourceFile};
use crate::error::{EtlError, Result};

/// Raw payload of one source file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub from_cache: bool,
}

impl FetchedFile {
    pub fn new(bytes: Vec<u8>, from_cache: bool) -> Self {
        let content_hash = content_hash(&bytes);
        Self {
            bytes,
            content_hash,
            from_cache,
        }
    }
}

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, source: &SourceFile) -> Result<FetchedFile>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
    rate_limit: Duration,
    force: bool,
}

impl HttpFetcher {
    pub fn new(config: &Config, force: bool) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent("ida-etl/0.1 (carga do data mart IDA)")
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            cache_dir: config.raw_fs_dir.clone(),
            rate_limit: Duration::from_millis(config.rate_limit_ms),
            force,
        })
    }

    /// Cache location: label plus a url digest, so two urls never share a file.
    pub fn cache_path(&self, source: &SourceFile) -> PathBuf {
        let digest = content_hash(source.url.as_bytes());
        let short = &digest["sha256:".len().."sha256:".len() + 16];
        let filename = format!("{}-{}.{}", source.label(), short, url_extension(&source.url));
        self.cache_dir.join(filename)
    }

    async fn read_cache(&self, source: &SourceFile) -> Option<Vec<u8>> {
        if self.force {
            return None;
        }
        match fs::read(self.cache_path(source)).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    async fn write_cache(&self, source: &SourceFile, bytes: &[u8]) {
        let path = self.cache_path(source);
        let result = async {
            fs::create_dir_all(&self.cache_dir).await?;
            fs::write(&path, bytes).await
        }
        .await;

        match result {
            Ok(()) => debug!(path = %path.display(), "cached source file"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not write cache file"),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        if !self.rate_limit.is_zero() {
            debug!(wait_ms = self.rate_limit.as_millis() as u64, "rate limit");
            sleep(self.rate_limit).await;
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EtlError::fetch(url, e))?
            .error_for_status()
            .map_err(|e| EtlError::fetch(url, e))?;

        let bytes = resp.bytes().await.map_err(|e| EtlError::fetch(url, e))?;
        if bytes.is_empty() {
            return Err(EtlError::fetch(url, "empty response body"));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, source: &SourceFile) -> Result<FetchedFile> {
        if let Some(bytes) = self.read_cache(source).await {
            let file = FetchedFile::new(bytes, true);
            info!(
                file = %source.label(),
                bytes = file.bytes.len(),
                hash = %file.content_hash,
                "using cached copy"
            );
            return Ok(file);
        }

        info!(file = %source.label(), url = %source.url, "downloading");
        let bytes = self.download(&source.url).await?;
        self.write_cache(source, &bytes).await;
        Ok(FetchedFile::new(bytes, false))
    }
}

fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_lowercase()
        }
        _ => "bin".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_config(dir: PathBuf) -> Config {
        Config {
            db_url: None,
            db_schema: "ida_datamart".into(),
            raw_fs_dir: dir,
            rate_limit_ms: 0,
            http_timeout: Duration::from_secs(2),
            accept_invalid_certs: false,
            json_logs: false,
        }
    }

    fn source(url: &str) -> SourceFile {
        SourceFile {
            service: Some("SMP".into()),
            year: 2019,
            month: None,
            url: url.into(),
            sheet: None,
            enabled: true,
        }
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://x.org/PDA/IDA/SMP2019.ods"), "ods");
        assert_eq!(url_extension("https://x.org/a/b.CSV?download=1"), "csv");
        assert_eq!(url_extension("https://x.org/download"), "bin");
    }

    #[test]
    fn test_cache_path_is_stable_and_url_specific() {
        let fetcher = HttpFetcher::new(&test_config(PathBuf::from("/tmp/cache")), false).unwrap();
        let a = fetcher.cache_path(&source("https://x.org/SMP2019.ods"));
        let b = fetcher.cache_path(&source("https://x.org/SMP2019.ods"));
        let c = fetcher.cache_path(&source("https://y.org/SMP2019.ods"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("SMP-2019-"));
        assert!(name.ends_with(".ods"));
    }

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let dir = std::env::temp_dir().join(format!("ida-etl-{}", Uuid::new_v4()));
        let fetcher = HttpFetcher::new(&test_config(dir.clone()), false).unwrap();
        // Nothing listens on the discard port, so a network attempt would fail.
        let src = source("http://127.0.0.1:9/SMP2019.ods");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(fetcher.cache_path(&src), b"cached bytes").unwrap();

        let file = fetcher.fetch(&src).await.unwrap();
        assert!(file.from_cache);
        assert_eq!(file.bytes, b"cached bytes");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unreachable_url_is_fetch_error() {
        let dir = std::env::temp_dir().join(format!("ida-etl-{}", Uuid::new_v4()));
        let fetcher = HttpFetcher::new(&test_config(dir), true).unwrap();
        let err = fetcher
            .fetch(&source("http://127.0.0.1:9/SMP2019.ods"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }
}
