//! Filesystem backing store

use super::{BackingStore, StoreId, StoreListing};
use crate::error::Result;
use crate::types::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Stores one file per object under a root directory
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &StoreId) -> PathBuf {
        self.root.join(id.object_name())
    }

    fn manifest_path(&self, id: &StoreId) -> PathBuf {
        self.root.join(id.manifest_name())
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl BackingStore for FsStore {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        info!(root = ?self.root, "Filesystem store initialized");
        Ok(())
    }

    async fn write(&self, id: &StoreId, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.object_path(id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read(&self, id: &StoreId, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = fs::File::open(self.object_path(id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn delete(&self, id: &StoreId) -> Result<()> {
        remove_if_exists(&self.manifest_path(id)).await?;
        remove_if_exists(&self.object_path(id)).await?;
        debug!(object = %id.object_name(), "Deleted object");
        Ok(())
    }

    async fn durable_length(&self, id: &StoreId) -> Result<u64> {
        match fs::metadata(self.object_path(id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, id: &StoreId, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec(manifest)?;
        // Write then rename so a crash never leaves a torn manifest behind
        let tmp = self.root.join(format!("{}.tmp", id.manifest_name()));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.manifest_path(id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<StoreListing> {
        let mut listing = StoreListing::default();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if let Some(id) = StoreId::parse_manifest_name(name) {
                match fs::read(item.path()).await {
                    Ok(raw) => match serde_json::from_slice::<Manifest>(&raw) {
                        Ok(manifest) => listing.manifests.push((id, manifest)),
                        Err(e) => warn!(file = %name, error = %e, "Skipping unreadable manifest"),
                    },
                    Err(e) => warn!(file = %name, error = %e, "Failed to read manifest"),
                }
            } else if let Some(id) = StoreId::parse_object_name(name) {
                listing.objects.push(id);
            } else if name.ends_with(".tmp") {
                if let Err(e) = fs::remove_file(item.path()).await {
                    warn!(file = %name, error = %e, "Failed to remove leftover temp file");
                }
            }
        }

        Ok(listing)
    }
}
