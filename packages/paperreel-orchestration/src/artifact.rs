use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque reference into the blob store. The engine never dereferences
/// these; it only records and hands them out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(r: impl Into<String>) -> Self {
        Self(r.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable artifact keys shared across every implementation of the pipeline.
pub mod keys {
    pub const PAPER_PARSED: &str = "paper.parsed";
    pub const PAPER_UNDERSTANDING: &str = "paper.understanding";
    pub const SCRIPT: &str = "script";
    pub const VISUAL_PLAN: &str = "visual_plan";
    pub const VIDEO_FINAL: &str = "video.final";
    pub const METADATA: &str = "metadata";

    pub fn scene_animation(n: usize) -> String {
        format!("scene.{}.animation", n)
    }

    pub fn scene_audio(n: usize) -> String {
        format!("scene.{}.audio", n)
    }
}

/// Declared artifact key, possibly per-scene (`scene.<n>.animation`).
///
/// The scene count is only known at run time, so per-scene declarations
/// match any non-negative index in the `<n>` position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPattern(String);

impl ArtifactPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_per_scene(&self) -> bool {
        self.0.contains("<n>")
    }

    pub fn matches(&self, key: &str) -> bool {
        match self.0.split_once("<n>") {
            None => self.0 == key,
            Some((prefix, suffix)) => {
                let Some(rest) = key.strip_prefix(prefix) else {
                    return false;
                };
                let Some(middle) = rest.strip_suffix(suffix) else {
                    return false;
                };
                !middle.is_empty() && middle.bytes().all(|b| b.is_ascii_digit())
            }
        }
    }
}

impl std::fmt::Display for ArtifactPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed byte storage, external to the core. Workers read and
/// write payloads through this; the engine itself only moves [`BlobRef`]s.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> anyhow::Result<BlobRef>;
    async fn get(&self, blob: &BlobRef) -> anyhow::Result<Option<Vec<u8>>>;
}

/// In-memory blob store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> anyhow::Result<BlobRef> {
        let blob = BlobRef::new(format!("mem://{}", Uuid::new_v4()));
        self.blobs.lock().insert(blob.as_str().to_string(), bytes);
        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(blob.as_str()).cloned())
    }
}
