//! In-memory backing store

use super::{BackingStore, StoreId, StoreListing};
use crate::error::{CacheError, Result};
use crate::types::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use tokio::sync::RwLock;

/// Keeps every object in memory; nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<StoreId, Vec<u8>>>,
    manifests: RwLock<HashMap<StoreId, Manifest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn write(&self, id: &StoreId, offset: u64, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().await;
        let object = objects.entry(id.clone()).or_default();
        let offset = offset as usize;

        if offset > object.len() {
            return Err(CacheError::from(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write at {} would leave a gap after {}", offset, object.len()),
            )));
        }

        let end = offset + data.len();
        if end > object.len() {
            object.resize(end, 0);
        }
        object[offset..end].copy_from_slice(data);
        Ok(())
    }

    async fn read(&self, id: &StoreId, offset: u64, len: usize) -> Result<Bytes> {
        let objects = self.objects.read().await;
        let object = objects
            .get(id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, id.object_name()))?;

        let start = (offset as usize).min(object.len());
        let end = start.saturating_add(len).min(object.len());
        Ok(Bytes::copy_from_slice(&object[start..end]))
    }

    async fn delete(&self, id: &StoreId) -> Result<()> {
        self.manifests.write().await.remove(id);
        self.objects.write().await.remove(id);
        Ok(())
    }

    async fn durable_length(&self, id: &StoreId) -> Result<u64> {
        let objects = self.objects.read().await;
        Ok(objects.get(id).map_or(0, |o| o.len() as u64))
    }

    async fn commit(&self, id: &StoreId, manifest: &Manifest) -> Result<()> {
        self.manifests
            .write()
            .await
            .insert(id.clone(), manifest.clone());
        Ok(())
    }

    async fn list(&self) -> Result<StoreListing> {
        let manifests = self.manifests.read().await;
        let objects = self.objects.read().await;
        Ok(StoreListing {
            manifests: manifests
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect(),
            objects: objects.keys().cloned().collect(),
        })
    }
}
