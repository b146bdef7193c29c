//! Hub access: repository file index and resumable transfers
//!
//! The production client talks to the HuggingFace Hub. File sizes come from the
//! tree API, since the hf-hub crate only exposes per-file downloads; hf-hub is
//! still used to build resolve URLs and to find the user's token.
//!
//! Transfers write into `<file>.incomplete` and rename on completion, so an
//! interrupted run leaves partial bytes that the next run resumes from.

use crate::config::HubConfig;
use async_trait::async_trait;
use futures::StreamExt;
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Suffix of in-flight transfer files
pub const PARTIAL_SUFFIX: &str = ".incomplete";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("repository '{repo_id}' is unreachable: {reason}")]
    Unreachable { repo_id: String, reason: String },

    #[error("repository '{repo_id}' is gated")]
    Gated { repo_id: String },

    #[error("transfer of '{path}' failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One file advertised by a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    /// 0 when the hub did not report a size
    pub size: u64,
}

/// Expected contents of a repository: relative path -> size in bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoIndex {
    pub repo_id: String,
    pub files: BTreeMap<String, u64>,
}

impl RepoIndex {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, size: u64) -> Self {
        self.files.insert(path.into(), size);
        self
    }

    /// True iff at least one file carries a non-zero size
    pub fn has_size_info(&self) -> bool {
        self.files.values().any(|size| *size > 0)
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().sum()
    }

    pub fn remote_files(&self) -> Vec<RemoteFile> {
        self.files
            .iter()
            .map(|(path, size)| RemoteFile {
                path: path.clone(),
                size: *size,
            })
            .collect()
    }
}

/// Remote model hub
#[async_trait]
pub trait HubClient: Send + Sync {
    /// List every file of a repository with its size
    async fn list_files(&self, repo_id: &str) -> Result<RepoIndex, HubError>;

    /// Fetch `files` from `repo_id` into `target`, resuming partial files
    async fn download(
        &self,
        repo_id: &str,
        target: &Path,
        files: &[RemoteFile],
    ) -> Result<(), HubError>;

    /// Fetch the whole repository when no sized listing is available
    ///
    /// Returns the relative paths that were fetched.
    async fn download_snapshot(&self, repo_id: &str, target: &Path) -> Result<Vec<String>, HubError>;
}

/// Partial-transfer path for a target file (`a/b.bin` -> `a/b.bin.incomplete`)
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: Option<u64>,
}

/// HuggingFace Hub client
pub struct HfHubClient {
    http: reqwest::Client,
    api: Api,
    endpoint: String,
    revision: String,
    token: Option<String>,
    list_timeout: Duration,
}

impl HfHubClient {
    pub fn new(config: &HubConfig) -> Result<Self, HubError> {
        let token = resolve_token();
        let endpoint = config.endpoint.trim_end_matches('/').to_string();

        let api = ApiBuilder::new()
            .with_endpoint(endpoint.clone())
            .with_token(token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| HubError::Unreachable {
                repo_id: String::new(),
                reason: format!("failed to create hub client: {e}"),
            })?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("diffuser-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::Unreachable {
                repo_id: String::new(),
                reason: format!("failed to create http client: {e}"),
            })?;

        tracing::debug!(
            endpoint = %endpoint,
            revision = %config.revision,
            authenticated = token.is_some(),
            "Hub client created"
        );

        Ok(Self {
            http,
            api,
            endpoint,
            revision: config.revision.clone(),
            token,
            list_timeout: Duration::from_secs(config.list_timeout_secs),
        })
    }

    fn repo(&self, repo_id: &str) -> Repo {
        Repo::with_revision(repo_id.to_string(), RepoType::Model, self.revision.clone())
    }

    fn file_url(&self, repo_id: &str, path: &str) -> String {
        self.api.repo(self.repo(repo_id)).url(path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_file(&self, repo_id: &str, target: &Path, file: &RemoteFile) -> Result<(), HubError> {
        let dest = target.join(&file.path);
        if let Ok(meta) = tokio::fs::metadata(&dest).await
            && meta.is_file()
            && (file.size == 0 || meta.len() == file.size)
        {
            tracing::debug!(repo_id = %repo_id, file = %file.path, "Already present, skipping");
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&dest);
        let mut existing = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if file.size > 0 && existing == file.size {
            tokio::fs::rename(&partial, &dest).await?;
            return Ok(());
        }
        if file.size > 0 && existing > file.size {
            tracing::warn!(
                repo_id = %repo_id,
                file = %file.path,
                partial_bytes = existing,
                expected = file.size,
                "Partial larger than the remote file, restarting"
            );
            tokio::fs::remove_file(&partial).await?;
            existing = 0;
        }

        let transfer_err = |reason: String| HubError::Transfer {
            path: file.path.clone(),
            reason,
        };

        let mut request = self.authorized(self.http.get(self.file_url(repo_id, &file.path)));
        if existing > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={existing}-"));
            tracing::info!(repo_id = %repo_id, file = %file.path, offset = existing, "Resuming transfer");
        }

        let response = request.send().await.map_err(|e| transfer_err(e.to_string()))?;
        let status = response.status();

        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // Partial already holds the whole file
            tokio::fs::rename(&partial, &dest).await?;
            return Ok(());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HubError::Gated {
                repo_id: repo_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(transfer_err(format!("HTTP {status}")));
        }

        // A 200 to a ranged request restarts from byte 0; skip what we have
        let mut skip = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            0
        } else {
            existing
        };

        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transfer_err(e.to_string()))?;
            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
            }
            if !data.is_empty() {
                out.write_all(data).await?;
            }
        }
        out.flush().await?;
        drop(out);

        let written = tokio::fs::metadata(&partial).await?.len();
        if file.size > 0 && written != file.size {
            // A short body is resumed next time; an oversized one cannot be trusted
            if written > file.size {
                tokio::fs::remove_file(&partial).await?;
            }
            return Err(transfer_err(format!(
                "received {written} of {} bytes",
                file.size
            )));
        }

        tokio::fs::rename(&partial, &dest).await?;
        tracing::debug!(repo_id = %repo_id, file = %file.path, "File transferred");
        Ok(())
    }
}

#[async_trait]
impl HubClient for HfHubClient {
    async fn list_files(&self, repo_id: &str) -> Result<RepoIndex, HubError> {
        let unreachable = |reason: String| HubError::Unreachable {
            repo_id: repo_id.to_string(),
            reason,
        };

        let mut index = RepoIndex::new(repo_id);
        let mut next = Some(format!(
            "{}/api/models/{}/tree/{}?recursive=true",
            self.endpoint, repo_id, self.revision
        ));

        while let Some(url) = next.take() {
            let response = self
                .authorized(self.http.get(&url))
                .timeout(self.list_timeout)
                .send()
                .await
                .map_err(|e| unreachable(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Err(HubError::Gated {
                    repo_id: repo_id.to_string(),
                });
            }
            if !status.is_success() {
                return Err(unreachable(format!("HTTP {status}")));
            }

            next = response
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_page_link);

            let entries: Vec<TreeEntry> = response
                .json()
                .await
                .map_err(|e| unreachable(format!("invalid tree listing: {e}")))?;
            for entry in entries.into_iter().filter(|e| e.kind == "file") {
                index.files.insert(entry.path, entry.size.unwrap_or(0));
            }
        }

        tracing::debug!(
            repo_id = %repo_id,
            files = index.files.len(),
            total_bytes = index.total_size(),
            "Repository index fetched"
        );
        Ok(index)
    }

    async fn download(
        &self,
        repo_id: &str,
        target: &Path,
        files: &[RemoteFile],
    ) -> Result<(), HubError> {
        tokio::fs::create_dir_all(target).await?;
        for file in files {
            self.fetch_file(repo_id, target, file).await?;
        }
        Ok(())
    }

    async fn download_snapshot(&self, repo_id: &str, target: &Path) -> Result<Vec<String>, HubError> {
        let info = self
            .api
            .repo(self.repo(repo_id))
            .info()
            .await
            .map_err(|e| HubError::Unreachable {
                repo_id: repo_id.to_string(),
                reason: e.to_string(),
            })?;

        let files: Vec<RemoteFile> = info
            .siblings
            .into_iter()
            .map(|sibling| RemoteFile {
                path: sibling.rfilename,
                size: 0,
            })
            .collect();
        tracing::info!(repo_id = %repo_id, files = files.len(), "Fetching repository snapshot without sizes");

        self.download(repo_id, target, &files).await?;
        Ok(files.into_iter().map(|f| f.path).collect())
    }
}

/// Hub token: `HF_TOKEN`, then the token file hf-hub manages
pub fn resolve_token() -> Option<String> {
    std::env::var("HF_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| hf_hub::Cache::from_env().token())
}

/// Extract the `rel="next"` target from a Link header
fn next_page_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == "rel=\"next\"")
            .then(|| url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}
