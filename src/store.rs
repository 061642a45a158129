use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{FixedOffset, Local};

use crate::descriptor::FileDescriptor;
use crate::transport::FileSink;
use crate::{Result, TransferError};

const LOG_PREFIX: &str = "[local-store]";
const PARTIAL_SUFFIX: &str = "part";

/// Export directory holding retrieved files under their canonical names.
pub struct LocalStore {
    root: PathBuf,
    /// Zone legacy names were stamped in; the phone's local zone if unset.
    legacy_offset: Option<FixedOffset>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            legacy_offset: None,
        }
    }

    pub fn with_legacy_offset(mut self, offset: FixedOffset) -> Self {
        self.legacy_offset = Some(offset);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_path(&self, descriptor: &FileDescriptor) -> PathBuf {
        self.root.join(descriptor.output_path())
    }

    /// Canonical location first, then the layouts of earlier releases.
    pub fn candidate_paths(&self, descriptor: &FileDescriptor) -> Vec<PathBuf> {
        let legacy = match self.legacy_offset {
            Some(offset) => descriptor.legacy_file_names_in(&offset),
            None => descriptor.legacy_file_names_in(&Local),
        };
        let mut paths = vec![self.canonical_path(descriptor)];
        paths.extend(legacy.into_iter().map(|name| self.root.join(name)));
        paths
    }

    /// First existing, non-empty copy of the descriptor.
    pub fn find_existing(&self, descriptor: &FileDescriptor) -> Option<PathBuf> {
        self.candidate_paths(descriptor).into_iter().find(|path| {
            fs::metadata(path)
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false)
        })
    }

    /// Write the file through a temporary sibling and move it into place,
    /// stamping the peer's modification time when known.
    pub fn save(
        &self,
        descriptor: &FileDescriptor,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.canonical_path(descriptor);
        let parent = path.parent().ok_or_else(|| {
            TransferError::Config(format!("{} has no parent", path.display()))
        })?;
        fs::create_dir_all(parent)?;

        let temp = path.with_extension(PARTIAL_SUFFIX);
        {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;

        if let Some(modified) = descriptor.modified {
            let file = File::options().write(true).open(&path)?;
            file.set_modified(SystemTime::from(modified))?;
        }
        log::info!(
            "{} saved {} bytes to {}",
            LOG_PREFIX,
            bytes.len(),
            path.display()
        );
        Ok(path)
    }
}

impl FileSink for LocalStore {
    fn is_present(&self, descriptor: &FileDescriptor) -> bool {
        match self.find_existing(descriptor) {
            Some(path) => {
                log::debug!(
                    "{} {} already at {}",
                    LOG_PREFIX,
                    descriptor,
                    path.display()
                );
                true
            }
            None => false,
        }
    }

    fn on_transfer_complete(
        &mut self,
        descriptor: &FileDescriptor,
        bytes: &[u8],
    ) -> Result<Option<PathBuf>> {
        self.save(descriptor, bytes).map(Some)
    }

    fn on_transfer_failed(
        &mut self,
        descriptor: &FileDescriptor,
        reason: &TransferError,
    ) {
        log::warn!("{} not saving {}: {}", LOG_PREFIX, descriptor, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FileHandle, FileKind};
    use chrono::{TimeZone, Utc};
    use tempdir::TempDir;

    fn utc_store(dir: &TempDir) -> LocalStore {
        LocalStore::new(dir.path())
            .with_legacy_offset(FixedOffset::east_opt(0).unwrap())
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new(FileHandle::Index(42), FileKind::Activity, 3)
            .with_modified(Utc.with_ymd_and_hms(2023, 11, 2, 18, 30, 0).unwrap())
    }

    #[test]
    fn save_uses_canonical_layout() {
        let dir = TempDir::new("local_store").unwrap();
        let mut store = LocalStore::new(dir.path());
        let path = store
            .on_transfer_complete(&descriptor(), b"fit")
            .unwrap()
            .unwrap();
        assert_eq!(
            path,
            dir.path()
                .join("ACTIVITY/2023/ACTIVITY_2023-11-02_18-30-00_42.fit")
        );
        assert_eq!(fs::read(&path).unwrap(), b"fit");
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(
            modified,
            SystemTime::from(descriptor().modified.unwrap())
        );
        assert!(store.is_present(&descriptor()));
    }

    #[test]
    fn legacy_names_count_as_present() {
        let dir = TempDir::new("local_store").unwrap();
        let store = utc_store(&dir);
        assert!(!store.is_present(&descriptor()));

        let legacy = dir.path().join("ACTIVITY_42_2023-11-02_18-30-00.fit");
        fs::write(&legacy, b"old").unwrap();
        assert_eq!(store.find_existing(&descriptor()), Some(legacy));
    }

    #[test]
    fn root_level_name_counts_as_present() {
        let dir = TempDir::new("local_store").unwrap();
        let store = utc_store(&dir);
        fs::write(
            dir.path().join("ACTIVITY_2023-11-02_18-30-00_42.fit"),
            b"old",
        )
        .unwrap();
        assert!(store.is_present(&descriptor()));
    }

    #[test]
    fn legacy_names_follow_the_store_zone() {
        let dir = TempDir::new("local_store").unwrap();
        let stamped = dir.path().join("ACTIVITY_42_2023-11-02_20-30-00.fit");
        fs::write(stamped, b"old").unwrap();
        assert!(!utc_store(&dir).is_present(&descriptor()));

        let east = FixedOffset::east_opt(2 * 3600).unwrap();
        let store = LocalStore::new(dir.path()).with_legacy_offset(east);
        assert!(store.is_present(&descriptor()));
    }

    #[test]
    fn local_zone_is_the_default() {
        let dir = TempDir::new("local_store").unwrap();
        let name = descriptor().legacy_file_names().remove(1);
        fs::write(dir.path().join(name), b"old").unwrap();
        assert!(LocalStore::new(dir.path()).is_present(&descriptor()));
    }

    #[test]
    fn empty_files_do_not_count() {
        let dir = TempDir::new("local_store").unwrap();
        let store = LocalStore::new(dir.path());
        let path = store.canonical_path(&descriptor());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        assert!(!store.is_present(&descriptor()));
    }
}
