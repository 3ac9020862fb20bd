//! Durable weight cache for the in-process engine.
//!
//! Each model's weights are stored as zstd-compressed shards:
//! `<cache_dir>/<model_id>/shard-<n>.bin.zst`. Uses tokio's async file I/O.

use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

/// zstd level used for cached shards.
const ZSTD_LEVEL: i32 = 3;

/// On-disk store for model weight shards.
#[derive(Debug)]
pub struct WeightCache {
    /// Base directory.
    root: PathBuf,

    /// Transfer statistics.
    stats: WeightCacheStats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WeightCacheStats {
    pub shards_written: u64,
    pub shards_read: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl WeightCache {
    /// Open (and create if needed) the cache rooted at `root`.
    pub async fn open(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: WeightCacheStats::default(),
        })
    }

    pub fn stats(&self) -> WeightCacheStats {
        self.stats
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        // Model ids may contain '/' (org/name); keep one directory level per model.
        self.root.join(model_id.replace(['/', '\\'], "--"))
    }

    fn shard_path(&self, model_id: &str, shard: usize) -> PathBuf {
        self.model_dir(model_id).join(format!("shard-{shard}.bin.zst"))
    }

    /// Whether shard `shard` of `model_id` is cached.
    pub async fn contains(&self, model_id: &str, shard: usize) -> bool {
        fs::try_exists(self.shard_path(model_id, shard))
            .await
            .unwrap_or(false)
    }

    /// Compress and write one shard.
    pub async fn write_shard(
        &mut self,
        model_id: &str,
        shard: usize,
        data: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.shard_path(model_id, shard);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let compressed = zstd::encode_all(data, ZSTD_LEVEL)?;
        fs::write(&path, &compressed).await?;

        debug!(
            model = model_id,
            shard,
            raw = data.len(),
            compressed = compressed.len(),
            path = %path.display(),
            "Cached weight shard"
        );

        self.stats.shards_written += 1;
        self.stats.bytes_written += compressed.len() as u64;
        Ok(path)
    }

    /// Read and decompress one shard.
    pub async fn read_shard(&mut self, model_id: &str, shard: usize) -> std::io::Result<Vec<u8>> {
        let path = self.shard_path(model_id, shard);
        let compressed = fs::read(&path).await?;
        let data = zstd::decode_all(compressed.as_slice())?;

        self.stats.shards_read += 1;
        self.stats.bytes_read += compressed.len() as u64;
        Ok(data)
    }

    /// Remove every cached shard of `model_id`.
    pub async fn evict(&mut self, model_id: &str) -> std::io::Result<()> {
        let dir = self.model_dir(model_id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
