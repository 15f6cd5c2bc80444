//! HuggingFace model resolution
//!
//! Maps a model config to a GGUF file on local disk, downloading it from the
//! HuggingFace Hub when it is not there yet.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::types::model::{format_size, ModelConfig, WeightVariant};

const USER_AGENT: &str = concat!("locallab/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid model reference: {0}")]
    InvalidReference(String),

    #[error("No GGUF file found: {0}")]
    NoGgufFile(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Http(e.to_string())
    }
}

/// Locates the GGUF file for a model
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Local path to a GGUF file for `config`, trying weight variants in
    /// `preference` order
    async fn resolve(
        &self,
        config: &ModelConfig,
        preference: &[WeightVariant],
    ) -> Result<PathBuf, DownloadError>;
}

/// Parsed HuggingFace reference
#[derive(Debug, Clone)]
pub struct HuggingFaceUrl {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

fn sanitize_local_filename(filename: &str) -> Result<String, DownloadError> {
    let invalid = || DownloadError::InvalidReference(format!("bad filename {:?}", filename));

    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let no_query = trimmed.split('?').next().unwrap_or(trimmed);
    let no_fragment = no_query.split('#').next().unwrap_or(no_query);
    let no_leading = no_fragment.trim_start_matches('/');

    let flattened = no_leading.replace('\\', "/").replace('/', "__");

    let mut sanitized: String = flattened
        .chars()
        .map(|ch| {
            let reserved = matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*');
            if reserved || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(invalid());
    }
    Ok(sanitized)
}

impl HuggingFaceUrl {
    /// Parse a HuggingFace reference.
    ///
    /// Accepts `https://huggingface.co/owner/repo/{blob,resolve}/rev/file.gguf`,
    /// `https://huggingface.co/owner/repo`, `owner/repo/file.gguf` and
    /// `owner/repo`. An empty `filename` means "pick one from the repo".
    pub fn parse(reference: &str) -> Result<Self, DownloadError> {
        let reference = reference.trim();
        let reference = reference.split('?').next().unwrap_or(reference);
        let reference = reference.split('#').next().unwrap_or(reference);

        if reference.contains("huggingface.co") {
            let path = reference
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_start_matches("huggingface.co/");

            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            if parts.len() < 2 {
                return Err(DownloadError::InvalidReference(reference.to_string()));
            }
            let repo_id = format!("{}/{}", parts[0], parts[1]);

            if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
                if parts.len() > pos + 2 {
                    return Ok(Self {
                        repo_id,
                        filename: parts[pos + 2..].join("/"),
                        revision: parts[pos + 1].to_string(),
                    });
                }
            }

            return Ok(Self {
                repo_id,
                filename: String::new(),
                revision: "main".to_string(),
            });
        }

        let parts: Vec<&str> = reference.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(DownloadError::InvalidReference(reference.to_string()));
        }
        Ok(Self {
            repo_id: format!("{}/{}", parts[0], parts[1]),
            filename: parts[2..].join("/"),
            revision: "main".to_string(),
        })
    }

    pub fn download_url(&self) -> String {
        format!(
            "https://huggingface.co/{}/resolve/{}/{}",
            self.repo_id, self.revision, self.filename
        )
    }
}

/// Pick the file matching the first preferred variant, case-insensitively.
/// A repo with a single GGUF file needs no match.
pub fn pick_variant_file(files: &[String], preference: &[WeightVariant]) -> Option<String> {
    if files.len() == 1 {
        return Some(files[0].clone());
    }

    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    preference.iter().find_map(|variant| {
        variant.file_tags().iter().find_map(|tag| {
            let pattern = Pattern::new(&format!("*{}*.gguf", tag)).ok()?;
            files
                .iter()
                .filter(|f| pattern.matches_with(f, options))
                .min()
                .cloned()
        })
    })
}

/// Write the response body to `path`, returning the number of bytes written
async fn stream_to_file(
    response: &mut reqwest::Response,
    path: &Path,
    total_size: Option<u64>,
    label: &str,
) -> Result<u64, DownloadError> {
    let mut file = File::create(path).await?;
    let mut downloaded: u64 = 0;
    let mut next_report = 10;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(total) = total_size.filter(|t| *t > 0) {
            let percent = downloaded * 100 / total;
            if percent >= next_report {
                tracing::info!("Downloaded {}% of {}", percent, label);
                next_report = percent - percent % 10 + 10;
            }
        }
    }
    file.flush().await?;
    Ok(downloaded)
}

/// GGUF files already present in `dir`
pub fn list_local_models(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("*.gguf");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            tracing::warn!("Failed to scan {:?}: {}", dir, e);
            Vec::new()
        }
    }
}

/// Resolver backed by a local models directory and the HuggingFace Hub
pub struct HuggingFaceResolver {
    models_dir: PathBuf,
    token: Option<String>,
    client: reqwest::Client,
}

impl HuggingFaceResolver {
    pub fn new(models_dir: PathBuf, token: Option<String>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3600))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            models_dir,
            token,
            client,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List GGUF files in a repository
    async fn list_gguf_files(&self, repo_id: &str, revision: &str) -> Result<Vec<String>, DownloadError> {
        let api_url = format!(
            "https://huggingface.co/api/models/{}/tree/{}",
            repo_id, revision
        );

        let response = self.get(&api_url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Http(format!(
                "listing {} returned {}",
                repo_id,
                response.status()
            )));
        }

        let files: Vec<FileInfo> = response.json().await?;
        Ok(files
            .into_iter()
            .map(|f| f.path)
            .filter(|p| p.ends_with(".gguf"))
            .collect())
    }

    /// Download `url` into the models directory unless it is already there
    async fn fetch(&self, url: &HuggingFaceUrl) -> Result<PathBuf, DownloadError> {
        let safe_filename = sanitize_local_filename(&format!(
            "{}/{}",
            url.repo_id.replace('/', "--"),
            url.filename
        ))?;

        fs::create_dir_all(&self.models_dir)?;
        let output_path = self.models_dir.join(&safe_filename);
        let temp_path = self.models_dir.join(format!("{}.tmp", safe_filename));

        if fs::metadata(&output_path).map(|m| m.len() > 0).unwrap_or(false) {
            tracing::info!("Model already exists: {:?}", output_path);
            return Ok(output_path);
        }

        self.download_to(&url.download_url(), &output_path, &temp_path)
            .await?;
        Ok(output_path)
    }

    /// Download `download_url` into `temp_path`, then rename it to
    /// `output_path`. The temp file is removed on any failure.
    async fn download_to(
        &self,
        download_url: &str,
        output_path: &Path,
        temp_path: &Path,
    ) -> Result<(), DownloadError> {
        tracing::info!("Downloading from: {}", download_url);

        let mut response = self.get(download_url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Http(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            tracing::info!("File size: {}", format_size(total));
        }

        let label = output_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let written = stream_to_file(&mut response, temp_path, total_size, &label)
            .await
            .and_then(|downloaded| match total_size {
                Some(total) if downloaded != total => Err(DownloadError::Http(format!(
                    "download incomplete: got {} bytes, expected {}",
                    downloaded, total
                ))),
                _ => Ok(()),
            })
            .and_then(|()| fs::rename(temp_path, output_path).map_err(DownloadError::from));

        if let Err(e) = written {
            let _ = fs::remove_file(temp_path);
            return Err(e);
        }

        tracing::info!("Download complete: {:?}", output_path);
        Ok(())
    }
}

#[async_trait]
impl ModelResolver for HuggingFaceResolver {
    async fn resolve(
        &self,
        config: &ModelConfig,
        preference: &[WeightVariant],
    ) -> Result<PathBuf, DownloadError> {
        if config.registered {
            let repo = config
                .repo
                .as_ref()
                .ok_or_else(|| DownloadError::InvalidReference(config.id.clone()))?;
            let (variant, filename) = config
                .file_for(preference)
                .ok_or_else(|| DownloadError::NoGgufFile(config.id.clone()))?;
            tracing::info!("Resolved {} to {} ({})", config.id, filename, variant);
            return self
                .fetch(&HuggingFaceUrl {
                    repo_id: repo.clone(),
                    filename: filename.to_string(),
                    revision: "main".to_string(),
                })
                .await;
        }

        let local = Path::new(config.id.trim());
        if local.extension().is_some_and(|e| e.eq_ignore_ascii_case("gguf")) && local.is_file() {
            tracing::info!("Using local model file {:?}", local);
            return Ok(local.to_path_buf());
        }

        let mut url = HuggingFaceUrl::parse(&config.id)?;
        if url.filename.is_empty() {
            let files = self.list_gguf_files(&url.repo_id, &url.revision).await?;
            url.filename = pick_variant_file(&files, preference).ok_or_else(|| {
                if files.is_empty() {
                    DownloadError::NoGgufFile(url.repo_id.clone())
                } else {
                    DownloadError::NoGgufFile(format!(
                        "no preferred variant in {}; available: {}",
                        url.repo_id,
                        files.join(", ")
                    ))
                }
            })?;
        }
        self.fetch(&url).await
    }
}

#[derive(Debug, serde::Deserialize)]
struct FileInfo {
    path: String,
}
