//! SafeTensors checkpoint archive.
//!
//! A checkpoint is a single safetensors file. Every entry is a `U8` blob:
//! `net.<module>` holds a module's weight record and `optimizer.<module>` its
//! optimizer record. Counters live in the file metadata. Files are written to
//! a temporary sibling and renamed into place, so readers never observe a
//! partial archive.

use crate::error::TrainError;
use anyhow::{Context, Result};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Value of the `format` metadata key.
pub const ARCHIVE_FORMAT: &str = "styletts-train/1";

const NET_PREFIX: &str = "net.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Counters stored alongside the blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArchiveMeta {
    pub iters: usize,
    pub epoch: usize,
    pub val_loss: f32,
}

/// In-memory form of a checkpoint file, keyed by module name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointArchive {
    pub net: BTreeMap<String, Vec<u8>>,
    pub optimizer: BTreeMap<String, Vec<u8>>,
    pub meta: ArchiveMeta,
}

fn malformed(msg: impl Into<String>) -> anyhow::Error {
    TrainError::Checkpoint(msg.into()).into()
}

impl CheckpointArchive {
    /// Encode as safetensors bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut views = Vec::with_capacity(self.net.len() + self.optimizer.len());
        let groups = [(NET_PREFIX, &self.net), (OPTIMIZER_PREFIX, &self.optimizer)];
        for (prefix, entries) in groups {
            for (name, blob) in entries {
                let view = TensorView::new(Dtype::U8, vec![blob.len()], blob)
                    .map_err(|e| malformed(format!("entry {prefix}{name}: {e}")))?;
                views.push((format!("{prefix}{name}"), view));
            }
        }

        let metadata: HashMap<String, String> = [
            ("format", ARCHIVE_FORMAT.to_string()),
            ("iters", self.meta.iters.to_string()),
            ("epoch", self.meta.epoch.to_string()),
            ("val_loss", self.meta.val_loss.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        safetensors::tensor::serialize(views, &Some(metadata))
            .map_err(|e| malformed(format!("failed to serialize archive: {e}")))
    }

    /// Decode bytes written by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)
            .map_err(|e| malformed(format!("unreadable header: {e}")))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let format = metadata.get("format").map(String::as_str);
        if format != Some(ARCHIVE_FORMAT) {
            return Err(malformed(format!(
                "unsupported archive format {format:?}, expected {ARCHIVE_FORMAT}"
            )));
        }
        let field = |key: &str| -> Result<&str> {
            metadata
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| malformed(format!("metadata key `{key}` is missing")))
        };
        let meta = ArchiveMeta {
            iters: field("iters")?
                .parse()
                .map_err(|e| malformed(format!("bad iters: {e}")))?,
            epoch: field("epoch")?
                .parse()
                .map_err(|e| malformed(format!("bad epoch: {e}")))?,
            val_loss: field("val_loss")?
                .parse()
                .map_err(|e| malformed(format!("bad val_loss: {e}")))?,
        };

        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| malformed(format!("unreadable archive: {e}")))?;
        let mut archive = Self {
            meta,
            ..Self::default()
        };
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::U8 {
                return Err(malformed(format!("entry {name} has dtype {:?}", view.dtype())));
            }
            let blob = view.data().to_vec();
            if let Some(module) = name.strip_prefix(NET_PREFIX) {
                archive.net.insert(module.to_string(), blob);
            } else if let Some(module) = name.strip_prefix(OPTIMIZER_PREFIX) {
                archive.optimizer.insert(module.to_string(), blob);
            } else {
                tracing::warn!(entry = %name, "ignoring unrecognised checkpoint entry");
            }
        }
        Ok(archive)
    }

    /// Atomically replace `path` with this archive.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("failed to move checkpoint into {}", path.display()))?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("invalid checkpoint {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CheckpointArchive {
        let mut archive = CheckpointArchive {
            meta: ArchiveMeta {
                iters: 1500,
                epoch: 3,
                val_loss: 0.25,
            },
            ..CheckpointArchive::default()
        };
        archive.net.insert("decoder".into(), vec![1, 2, 3]);
        archive.net.insert("msd".into(), vec![9; 64]);
        archive.optimizer.insert("decoder".into(), vec![7]);
        archive.optimizer.insert("mpd".into(), Vec::new());
        archive
    }

    #[test]
    fn write_then_read_restores_blobs_and_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/current_model.safetensors");
        let archive = sample();
        archive.write(&path).expect("write");
        assert_eq!(CheckpointArchive::read(&path).expect("read"), archive);

        // Overwrite in place leaves no stray temp files behind.
        archive.write(&path).expect("rewrite");
        let entries = fs::read_dir(path.parent().expect("parent")).expect("ls").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn rejects_foreign_files() {
        let err = CheckpointArchive::from_bytes(b"not a checkpoint").expect_err("garbage");
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::Checkpoint(_))
        ));

        let plain = safetensors::tensor::serialize(
            vec![(
                "w".to_string(),
                TensorView::new(Dtype::U8, vec![1], &[0u8]).expect("view"),
            )],
            &None,
        )
        .expect("serialize");
        assert!(CheckpointArchive::from_bytes(&plain).is_err());
    }
}
