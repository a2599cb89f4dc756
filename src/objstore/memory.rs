use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{VaultError, VaultResult};

use super::ObjectBucket;

/// In-memory bucket. Backs the tests and small single-process setups.
#[derive(Debug, Default)]
pub struct MemBucket {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemBucket {
    pub fn new() -> MemBucket {
        MemBucket::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ObjectBucket for MemBucket {
    async fn list(&self, prefix: &str) -> VaultResult<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, path: &str) -> VaultResult<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| VaultError::ObjectNotFound(path.to_string()))
    }

    async fn get_range(&self, path: &str, offset: u64, len: u64) -> VaultResult<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(path)
            .ok_or_else(|| VaultError::ObjectNotFound(path.to_string()))?;
        let end = offset.checked_add(len).filter(|&e| e <= data.len() as u64);
        let Some(end) = end else {
            return Err(VaultError::ObjectStorage(format!(
                "range {offset}+{len} leaves object {path} of {} bytes",
                data.len()
            )));
        };
        Ok(data[offset as usize..end as usize].to_vec())
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> VaultResult<()> {
        self.objects.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn exists(&self, path: &str) -> VaultResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }
}
