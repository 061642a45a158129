//! Ownership of every live [`TransferRecord`].
//!
//! A slot is either an explicit session byte or, for the windowed variant,
//! the single implicit transfer per direction. At most one record lives in a
//! slot; a record leaves the registry exactly once, through `complete`,
//! `fail`, expiry, cancellation or a link loss.

use core::fmt::Display;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::descriptor::FileDescriptor;
use crate::record::{TransferDirection, TransferRecord};
use crate::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Session(u8),
    Current(TransferDirection),
}

impl Slot {
    /// Session byte carried in control messages for this slot.
    pub fn session_id(&self) -> u8 {
        match self {
            Slot::Session(id) => *id,
            Slot::Current(_) => 0,
        }
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Session(id) => write!(f, "session {}", id),
            Slot::Current(direction) => write!(f, "current {}", direction),
        }
    }
}

pub struct Admission<'a> {
    pub record: &'a mut TransferRecord,
    /// Stale occupant that was evicted to make room; its owner must be told.
    pub evicted: Option<TransferRecord>,
}

pub struct SessionRegistry {
    slots: HashMap<Slot, TransferRecord>,
    timeout: Duration,
    next_session: u8,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            timeout,
            next_session: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn begin(
        &mut self,
        slot: Slot,
        direction: TransferDirection,
        descriptor: FileDescriptor,
        size_hint: Option<u32>,
        now: Instant,
    ) -> Result<Admission<'_>> {
        let record = TransferRecord::new(direction, descriptor, size_hint, now);
        self.begin_with(slot, record, now)
    }

    /// Install a prepared record, evicting a stale occupant.
    pub fn begin_with(
        &mut self,
        slot: Slot,
        record: TransferRecord,
        now: Instant,
    ) -> Result<Admission<'_>> {
        let fresh = self
            .slots
            .get(&slot)
            .map(|existing| !existing.is_stale(now, self.timeout));
        let evicted = match fresh {
            Some(true) => {
                log::debug!("{} busy, rejecting {}", slot, record.descriptor());
                return Err(TransferError::SlotBusy(slot));
            }
            Some(false) => {
                let stale = self.slots.remove(&slot);
                if let Some(stale) = &stale {
                    log::warn!(
                        "Evicting stale {} of {} from {}",
                        stale.direction(),
                        stale.descriptor(),
                        slot
                    );
                }
                stale
            }
            None => None,
        };
        log::debug!(
            "{} begins {} of {}",
            slot,
            record.direction(),
            record.descriptor()
        );
        let record = self.slots.entry(slot).or_insert(record);
        Ok(Admission { record, evicted })
    }

    pub fn current(&self, slot: Slot) -> Option<&TransferRecord> {
        self.slots.get(&slot)
    }

    pub fn current_mut(&mut self, slot: Slot) -> Option<&mut TransferRecord> {
        self.slots.get_mut(&slot)
    }

    pub fn complete(&mut self, slot: Slot) -> Option<TransferRecord> {
        let record = self.slots.remove(&slot);
        if record.is_some() {
            log::debug!("{} completed", slot);
        }
        record
    }

    pub fn fail(&mut self, slot: Slot) -> Option<TransferRecord> {
        let record = self.slots.remove(&slot);
        if record.is_some() {
            log::debug!("{} failed", slot);
        }
        record
    }

    /// Mark the slot's record for eviction on the next event.
    pub fn cancel(&mut self, slot: Slot) -> bool {
        match self.slots.get_mut(&slot) {
            Some(record) => {
                log::info!("Cancelling {} of {}", record.direction(), slot);
                record.mark_cancelled();
                true
            }
            None => false,
        }
    }

    pub fn take_cancelled(&mut self) -> Vec<(Slot, TransferRecord)> {
        self.drain_where(|record| record.is_cancelled())
    }

    /// Remove every record idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(Slot, TransferRecord)> {
        let timeout = self.timeout;
        self.drain_where(|record| record.is_stale(now, timeout))
    }

    pub fn fail_all(&mut self) -> Vec<(Slot, TransferRecord)> {
        self.drain_where(|_| true)
    }

    fn drain_where<F>(&mut self, predicate: F) -> Vec<(Slot, TransferRecord)>
    where
        F: Fn(&TransferRecord) -> bool,
    {
        let slots = self
            .slots
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(slot, _)| *slot)
            .sorted()
            .collect_vec();
        slots
            .into_iter()
            .filter_map(|slot| self.slots.remove(&slot).map(|r| (slot, r)))
            .collect()
    }

    /// Next session byte with no live record, if any is left.
    pub fn allocate_session(&mut self) -> Option<u8> {
        for _ in 0..=u8::MAX {
            let candidate = self.next_session;
            self.next_session = self.next_session.wrapping_add(1);
            if !self.slots.contains_key(&Slot::Session(candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Descriptors of the live records moving in `direction`.
    pub fn in_flight(&self, direction: TransferDirection) -> Vec<&FileDescriptor> {
        self.slots
            .iter()
            .sorted_by_key(|(slot, _)| **slot)
            .filter(|(_, record)| record.direction() == direction)
            .map(|(_, record)| record.descriptor())
            .collect()
    }
}
