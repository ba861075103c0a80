use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::session::SessionRegistry;
use crate::{SyncError, SyncResult};

const ARCHIVE_EXTENSION: &str = "scene";
const NAME_EXTENSION: &str = "name";

/// Longest hex stem kept verbatim; longer names are hashed
const MAX_HEX_STEM: usize = 200;
const HASHED_PREFIX_BYTES: usize = 48;

/// On-disk store of room document snapshots
///
/// One file per room. Room names are hex encoded so any path maps to a safe
/// file name. Names too long for a file name are stored under a truncated
/// prefix plus a SHA-256 digest, with the full name in a `.name` file beside
/// the snapshot.
#[derive(Debug, Clone)]
pub struct RoomArchive {
    storage_path: PathBuf,
}

impl RoomArchive {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Ensure the storage directory exists
    pub async fn prepare(&self) -> SyncResult<()> {
        tokio::fs::create_dir_all(&self.storage_path).await?;
        Ok(())
    }

    /// Snapshot of `room`, or `None` if it was never archived
    pub async fn load(&self, room: &str) -> SyncResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(room)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Persistence(format!(
                "Failed to read archive for '{}': {}",
                room, e
            ))),
        }
    }

    /// Write a snapshot, replacing any previous one atomically
    pub async fn save(&self, room: &str, snapshot: &[u8]) -> SyncResult<()> {
        let path = self.path_for(room);
        if is_hashed(&path) {
            tokio::fs::write(path.with_extension(NAME_EXTENSION), room).await?;
        }
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, snapshot).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("Wrote {} bytes for room '{}' to {:?}", snapshot.len(), room, path);
        Ok(())
    }

    /// Names of every archived room
    pub async fn list(&self) -> SyncResult<Vec<String>> {
        let mut rooms = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.storage_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(decode_name) {
                Some(room) => rooms.push(room),
                None => match tokio::fs::read_to_string(path.with_extension(NAME_EXTENSION)).await {
                    Ok(room) => rooms.push(room),
                    Err(_) => debug!("Skipping foreign file {:?}", path),
                },
            }
        }

        rooms.sort();
        Ok(rooms)
    }

    fn path_for(&self, room: &str) -> PathBuf {
        self.storage_path
            .join(format!("{}.{}", encode_name(room), ARCHIVE_EXTENSION))
    }
}

fn encode_name(room: &str) -> String {
    let hex = to_hex(room.as_bytes());
    if hex.len() <= MAX_HEX_STEM {
        return hex;
    }
    let prefix = &room.as_bytes()[..HASHED_PREFIX_BYTES];
    format!("{}-{}", to_hex(prefix), to_hex(&Sha256::digest(room.as_bytes())))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn is_hashed(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| stem.contains('-'))
}

fn decode_name(stem: &str) -> Option<String> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(stem.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Periodically archives dirty room documents
pub struct PersistenceManager {
    registry: Arc<SessionRegistry>,
    check_interval: Duration,
    handles: JoinSet<()>,
}

impl PersistenceManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            check_interval: Duration::from_secs(10),
            handles: JoinSet::new(),
        }
    }

    /// Set the interval for checking dirty rooms
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    pub fn start(&mut self) {
        info!(
            "Starting persistence manager, checking every {:?}",
            self.check_interval
        );

        let registry = self.registry.clone();
        let check_interval = self.check_interval;

        self.handles.spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                interval.tick().await;
                let written = registry.archive_dirty().await;
                if written > 0 {
                    info!("Archived {} room(s)", written);
                }
            }
        });
    }

    /// Stop the periodic task after a final archive pass
    pub async fn stop(&mut self) {
        info!("Stopping persistence manager");

        let written = self.registry.archive_dirty().await;
        info!("Final archive pass wrote {} room(s)", written);

        self.handles.abort_all();
        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("Persistence task error: {}", e);
                }
            }
        }
    }
}
