//! Last displayed place, kept in a small JSON document.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::CacheError;
use crate::model::LastLocation;

#[derive(Clone)]
pub struct LastLocationStore {
    path: PathBuf,
    tx: Arc<watch::Sender<Option<LastLocation>>>,
    write_lock: Arc<Mutex<()>>,
}

impl LastLocationStore {
    /// Open the document at `path`, loading whatever is there now.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = read_record(&path);
        let (tx, _) = watch::channel(initial);
        Self {
            path,
            tx: Arc::new(tx),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the stored place. The file is replaced atomically.
    pub async fn save(&self, record: LastLocation) -> Result<(), CacheError> {
        self.save_if(record, || true).await.map(|_| ())
    }

    /// Like [`save`](Self::save), but `still_wanted` is evaluated under the
    /// write lock and the write is skipped when it returns `false`.
    ///
    /// Returns whether the record was written.
    pub async fn save_if<F>(&self, record: LastLocation, still_wanted: F) -> Result<bool, CacheError>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let path = self.path.clone();
        let tx = self.tx.clone();
        let lock = self.write_lock.clone();

        tokio::task::spawn_blocking(move || -> Result<bool, CacheError> {
            let _guard = lock.lock();
            if !still_wanted() {
                tracing::debug!("Skipped stale last location {}", record.location_id);
                return Ok(false);
            }
            let bytes = serde_json::to_vec_pretty(&record)?;
            write_atomic(&path, &bytes)?;
            tracing::debug!("Saved last location {}", record.location_id);
            tx.send_replace(Some(record));
            Ok(true)
        })
        .await?
    }

    /// Current record, or `None` if absent or unreadable. Never fails.
    pub async fn read_once(&self) -> Option<LastLocation> {
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || read_record(&path)).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Reading last location failed: {}", e);
                None
            }
        }
    }

    /// Live view; the receiver starts with the latest known value.
    pub fn observe(&self) -> watch::Receiver<Option<LastLocation>> {
        self.tx.subscribe()
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let path = self.path.clone();
        let tx = self.tx.clone();
        let lock = self.write_lock.clone();

        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let _guard = lock.lock();
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tx.send_replace(None);
            Ok(())
        })
        .await?
    }
}

fn read_record(path: &Path) -> Option<LastLocation> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Could not read {}: {}", path.display(), e);
            return None;
        }
    };

    let record: LastLocation = match serde_json::from_slice(&bytes) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Ignoring unreadable last location {}: {}", path.display(), e);
            return None;
        }
    };

    if record.location_id.as_str().is_empty() || !record.lat.is_finite() || !record.lon.is_finite() {
        tracing::warn!("Ignoring invalid last location in {}", path.display());
        return None;
    }
    Some(record)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    // Contents must hit the disk before the rename makes them visible
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}
