use async_trait::async_trait;

use crate::error::VaultResult;

mod memory;

pub use memory::MemBucket;

/// Narrow view of an object store: list, whole-object get, ranged get, put.
///
/// Objects are written once and never mutated, so implementations must be
/// safe for unlimited concurrent readers and need no read locking.
#[async_trait]
pub trait ObjectBucket: Send + Sync + 'static {
    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> VaultResult<Vec<String>>;

    async fn get(&self, path: &str) -> VaultResult<Vec<u8>>;

    /// `len` bytes starting at `offset`. A range leaving the object is an
    /// error, never a short read.
    async fn get_range(&self, path: &str, offset: u64, len: u64) -> VaultResult<Vec<u8>>;

    async fn put(&self, path: &str, data: Vec<u8>) -> VaultResult<()>;

    async fn exists(&self, path: &str) -> VaultResult<bool>;
}
