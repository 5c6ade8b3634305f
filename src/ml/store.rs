//! Versioned model persistence.
//!
//! A model file is a bincode-encoded format version followed by the model.
//! Files are replaced atomically so a reader never sees a partial write.

use std::fs;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Current on-disk format version
pub const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt model state: {0}")]
    Corrupt(String),
    #[error("Unsupported model format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Durable storage for a single live model instance.
pub trait ModelStore<M>: Send + Sync {
    /// `Ok(None)` when nothing was persisted yet.
    fn load(&self) -> Result<Option<M>, StoreError>;

    fn save(&self, model: &M) -> Result<(), StoreError>;
}

/// Model file on the local filesystem
#[derive(Debug)]
pub struct FileModelStore<M> {
    path: PathBuf,
    _model: PhantomData<fn() -> M>,
}

impl<M> FileModelStore<M> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _model: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<M> ModelStore<M> for FileModelStore<M>
where
    M: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<M>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = bytes.as_slice();
        let version: u32 = bincode::deserialize_from(&mut reader)
            .map_err(|e| StoreError::Corrupt(format!("unreadable header: {e}")))?;
        if version != MODEL_FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                expected: MODEL_FORMAT_VERSION,
            });
        }
        let model = bincode::deserialize_from(&mut reader)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(model))
    }

    fn save(&self, model: &M) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &MODEL_FORMAT_VERSION)
                .and_then(|_| bincode::serialize_into(&mut writer, model))
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
