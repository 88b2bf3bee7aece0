//! Where a pretrained checkpoint comes from.
//!
//! `pretrained_model` may name a local file, a HuggingFace Hub file
//! (`hf://owner/repo/path[@revision]`) or an HTTP(S) URL. Remote files are
//! cached under `~/.cache/styletts-train/`.

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Parsed checkpoint location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    Local(PathBuf),
    Hub {
        repo_id: String,
        filename: String,
        revision: Option<String>,
    },
    Http(String),
}

impl CheckpointSource {
    pub fn parse(location: &str) -> Result<Self> {
        if let Some(rest) = location.strip_prefix("hf://") {
            let mut parts = rest.splitn(3, '/');
            let (Some(owner), Some(repo), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("Invalid hf:// path: {location}");
            };
            if owner.is_empty() || repo.is_empty() || path.is_empty() {
                bail!("Invalid hf:// path: {location}");
            }
            let (filename, revision) = match path.split_once('@') {
                Some((file, rev)) => (file.to_string(), Some(rev.to_string())),
                None => (path.to_string(), None),
            };
            return Ok(Self::Hub {
                repo_id: format!("{owner}/{repo}"),
                filename,
                revision,
            });
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(Self::Http(location.to_string()));
        }
        Ok(Self::Local(PathBuf::from(location)))
    }

    /// Local path of the checkpoint, downloading it first if remote.
    pub fn fetch(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.exists() {
                    bail!("No such file or directory: {}", path.display());
                }
                Ok(path.clone())
            }
            Self::Hub {
                repo_id,
                filename,
                revision,
            } => {
                let repo = match revision {
                    Some(rev) => Repo::with_revision(repo_id.clone(), RepoType::Model, rev.clone()),
                    None => Repo::model(repo_id.clone()),
                };
                tracing::info!(repo = %repo_id, file = %filename, "fetching checkpoint from hub");
                Ok(Api::new()?.repo(repo).get(filename)?)
            }
            Self::Http(url) => fetch_url(url),
        }
    }
}

/// Create and return `~/.cache/styletts-train/`.
pub fn make_cache_directory() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    let dir = Path::new(&home).join(".cache").join("styletts-train");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Resolve a `pretrained_model` value to a readable local file.
pub fn download_if_necessary(location: &str) -> Result<PathBuf> {
    CheckpointSource::parse(location)?.fetch()
}

fn fetch_url(url: &str) -> Result<PathBuf> {
    let dir = make_cache_directory()?;
    let target = dir.join(cache_name(url));
    if target.exists() {
        return Ok(target);
    }

    tracing::info!(%url, "downloading checkpoint");
    let mut body = Vec::new();
    ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?
        .into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response from {url}"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)?;
    tracing::info!(path = %target.display(), bytes = body.len(), "download complete");
    Ok(target)
}

/// Flatten a URL into a file name.
fn cache_name(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
