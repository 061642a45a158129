//! Download queue coordinator.
//!
//! Decides what to fetch next and keeps exactly one download outstanding.
//! The coordinator owns no transfer state: it answers with [`QueueAction`]s
//! and is told about every completion or failure of the file it started.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::descriptor::{FileDescriptor, FileHandle, FLAG_ARCHIVED};
use crate::directory::{self, DirectoryEntry};
use crate::TransferError;

/// Aggregate of one batch, emitted once the queue runs dry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub bytes_retrieved: u64,
    pub bytes_declared: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    Start(FileDescriptor),
    /// Already present locally, not transferred.
    Skipped(FileDescriptor),
    /// Ask the peer to flag the file archived.
    MarkArchived { handle: FileHandle, flags: u8 },
    BatchFinished(BatchSummary),
}

pub struct DownloadQueue {
    pending: VecDeque<FileDescriptor>,
    current: Option<FileDescriptor>,
    retried: HashSet<FileHandle>,
    summary: BatchSummary,
    batch_active: bool,
    fetch_unknown: bool,
    keep_on_device: bool,
    retry_failed_once: bool,
}

impl DownloadQueue {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            retried: HashSet::new(),
            summary: BatchSummary::default(),
            batch_active: false,
            fetch_unknown: config.fetch_unknown_files,
            keep_on_device: config.keep_data_on_device,
            retry_failed_once: config.retry_failed_once,
        }
    }

    pub fn current(&self) -> Option<&FileDescriptor> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.pending.iter()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    pub fn enqueue(&mut self, descriptor: FileDescriptor) {
        log::debug!("Queueing {} for download", descriptor);
        self.batch_active = true;
        self.pending.push_back(descriptor);
    }

    /// Queue a directory pseudo-file; its children arrive once it is
    /// retrieved.
    pub fn enqueue_directory(&mut self, descriptor: FileDescriptor) {
        self.enqueue(descriptor)
    }

    /// Children of a retrieved directory listing.
    pub fn on_directory_listing(&mut self, entries: &[DirectoryEntry]) {
        for descriptor in directory::qualifying(entries, self.fetch_unknown) {
            self.enqueue(descriptor);
        }
    }

    pub fn on_directory_entries(&mut self, entries: Vec<FileDescriptor>) {
        for descriptor in entries {
            if descriptor.kind.is_supported() || self.fetch_unknown {
                self.enqueue(descriptor);
            } else {
                log::debug!("Skipping unsupported {}", descriptor);
            }
        }
    }

    /// One page of a server-driven file list; returns whether the next page
    /// should be requested.
    pub fn on_file_list_page(
        &mut self,
        entries: Vec<FileDescriptor>,
        has_more: bool,
    ) -> bool {
        log::debug!(
            "File list page with {} entries, more: {}",
            entries.len(),
            has_more
        );
        self.batch_active = true;
        self.on_directory_entries(entries);
        has_more
    }

    /// Advance the queue while nothing is in flight.
    ///
    /// Entries already present are skipped (and archived per policy) until
    /// one needs a transfer or the queue is exhausted.
    pub fn poll(
        &mut self,
        is_present: impl Fn(&FileDescriptor) -> bool,
    ) -> Vec<QueueAction> {
        let mut actions = vec![];
        if self.current.is_some() {
            return actions;
        }
        while let Some(descriptor) = self.pending.pop_front() {
            if !descriptor.is_directory() && is_present(&descriptor) {
                log::info!("{} already downloaded, skipping", descriptor);
                self.summary.files_skipped += 1;
                if let Some(action) = self.archive_action(&descriptor) {
                    actions.push(action);
                }
                actions.push(QueueAction::Skipped(descriptor));
                continue;
            }
            log::debug!("Starting {}", descriptor);
            self.current = Some(descriptor.clone());
            actions.push(QueueAction::Start(descriptor));
            return actions;
        }
        if self.batch_active {
            let summary = std::mem::take(&mut self.summary);
            log::info!(
                "Batch finished: {} completed, {} failed, {} skipped, {}/{} bytes",
                summary.files_completed,
                summary.files_failed,
                summary.files_skipped,
                summary.bytes_retrieved,
                summary.bytes_declared
            );
            self.batch_active = false;
            self.retried.clear();
            actions.push(QueueAction::BatchFinished(summary));
        }
        actions
    }

    /// The current download finished; `retrieved` is its verified size.
    pub fn on_completed(
        &mut self,
        descriptor: &FileDescriptor,
        retrieved: u64,
    ) -> Vec<QueueAction> {
        if !self.take_current(descriptor) {
            return vec![];
        }
        if descriptor.is_directory() {
            return vec![];
        }
        self.summary.files_completed += 1;
        self.summary.bytes_retrieved += retrieved;
        self.summary.bytes_declared += u64::from(descriptor.size);
        self.archive_action(descriptor).into_iter().collect()
    }

    /// The current download failed; the batch carries on with the next
    /// entry, re-queueing this one once when configured to.
    pub fn on_failed(&mut self, descriptor: &FileDescriptor, error: &TransferError) {
        if !self.take_current(descriptor) {
            return;
        }
        if self.retry_failed_once && self.retried.insert(descriptor.handle) {
            log::info!("Retrying {} after: {}", descriptor, error);
            self.pending.push_back(descriptor.clone());
            return;
        }
        log::warn!("Giving up on {}: {}", descriptor, error);
        if !descriptor.is_directory() {
            self.summary.files_failed += 1;
            self.summary.bytes_declared += u64::from(descriptor.size);
        }
    }

    /// Drop everything after a lost link; the current file is reported
    /// through `on_failed` by the caller.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn take_current(&mut self, descriptor: &FileDescriptor) -> bool {
        match &self.current {
            Some(current) if current == descriptor => {
                self.current = None;
                true
            }
            _ => {
                log::debug!("{} is not the current download", descriptor);
                false
            }
        }
    }

    fn archive_action(&self, descriptor: &FileDescriptor) -> Option<QueueAction> {
        if self.keep_on_device
            || descriptor.is_directory()
            || !descriptor.kind.is_supported()
            || descriptor.is_archived()
        {
            return None;
        }
        Some(QueueAction::MarkArchived {
            handle: descriptor.handle,
            flags: descriptor.flags | FLAG_ARCHIVED,
        })
    }
}
