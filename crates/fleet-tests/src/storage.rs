//! In-memory artifact storage.

use async_trait::async_trait;
use fleet_core::ports::ArtifactStorage;
use fleet_core::{Error, Result};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub const STORAGE_URL: &str = "https://storage.example.org";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub dest_path: String,
    pub dest_name: String,
    pub content: Vec<u8>,
}

impl Upload {
    pub fn url(&self) -> String {
        format!("{}/{}/{}", STORAGE_URL, self.dest_path, self.dest_name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// Records every upload; URLs live under [`STORAGE_URL`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    uploads: Mutex<Vec<Upload>>,
    offline: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every upload with a storage error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn find(&self, dest_path: &str, dest_name: &str) -> Option<Upload> {
        self.uploads()
            .into_iter()
            .find(|u| u.dest_path == dest_path && u.dest_name == dest_name)
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn upload_single(
        &self,
        local_file: &Path,
        dest_name: &str,
        dest_path: &str,
    ) -> Result<String> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage offline".into()));
        }
        let upload = Upload {
            dest_path: dest_path.to_string(),
            dest_name: dest_name.to_string(),
            content: tokio::fs::read(local_file).await?,
        };
        let url = upload.url();
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(upload);
        Ok(url)
    }
}
