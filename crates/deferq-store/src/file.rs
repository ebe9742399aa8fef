//! Directory-backed store: one file per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::{KeyValueStore, StoreError, validate_key};

/// Extension for value files.
const VALUE_EXT: &str = "json";

/// Longest encoded run used as a single path component. Leaves room for the
/// extension and temp suffix under the usual 255 byte name limit.
const SEGMENT_LEN: usize = 128;

/// Store that keeps each key in its own file under a directory.
///
/// Keys are encoded with URL-safe base64 so arbitrary strings map to valid
/// file names. Encodings longer than 128 characters are split into nested
/// directories, so key length is not bounded by the file name limit.
/// Writes go to a temporary sibling which is then renamed over the target,
/// so readers never observe a half-written value.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    initialized: AtomicBool,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Create a store rooted at `dir`. Nothing touches disk until `init`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            initialized: AtomicBool::new(false),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Directory holding the value files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(key.as_bytes());
        // base64 output is ASCII, so byte offsets are char boundaries
        let mut segments: Vec<&str> = encoded
            .as_bytes()
            .chunks(SEGMENT_LEN)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .collect();
        let name = segments.pop().unwrap_or_default();

        let mut path = self.dir.clone();
        path.extend(segments);
        path.push(format!("{name}.{VALUE_EXT}"));
        path
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        if !self.initialized.swap(true, Ordering::AcqRel) {
            debug!(dir = %self.dir.display(), "file store initialized");
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_initialized()?;
        validate_key(key)?;

        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        validate_key(key)?;

        let target = self.path_for(key);
        if let Some(parent) = target.parent().filter(|p| *p != self.dir) {
            fs::create_dir_all(parent).await?;
        }
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = target.with_extension(format!("{VALUE_EXT}.{seq}.tmp"));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(value.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        trace!(key, bytes = value.len(), "wrote value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        validate_key(key)?;

        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
