use log::debug;

use crate::{
    rewind::{
        error::JournalError,
        record::{RecordKind, RewindRecord},
        rewindable::RewinderId,
    },
    types::Tick,
};

/// Tick-ordered store of all retained state and event records.
///
/// Records are kept in a vector sorted by tick. Insertion scans backward
/// from the tail: records for the same tick can arrive from multiple
/// sources (local prediction, several peers), but in practice a new record
/// is near the end, so the scan is short. Within one tick, confirmed state
/// records sort after unconfirmed ones so that a forward replay applies
/// the confirmed value last.
pub struct RewindJournal {
    records: Vec<RewindRecord>,
    /// Oldest tick a future insert may target. Everything before it was
    /// consumed by a completed rewind.
    boundary: Tick,
    /// Oldest tick a rewind can still restore every rewindable at.
    /// Raised by garbage collection as superseded states are dropped.
    restorable_floor: Tick,
}

impl RewindJournal {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            boundary: 0,
            restorable_floor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn oldest_tick(&self) -> Option<Tick> {
        self.records.first().map(|r| r.tick)
    }

    pub fn boundary(&self) -> Tick {
        self.boundary
    }

    /// Oldest tick every rewindable still has a restorable state at or
    /// before. Records older than this can never be rewound to.
    pub fn restorable_floor(&self) -> Tick {
        self.restorable_floor
    }

    /// Marks everything before `tick` as consumed by a completed rewind.
    pub fn mark_consumed(&mut self, tick: Tick) {
        if tick > self.boundary {
            self.boundary = tick;
        }
    }

    /// Inserts a record keeping strict tick-ascending order. Inserting
    /// behind the consumed boundary is a programmer error and fails.
    pub fn insert(&mut self, record: RewindRecord) -> Result<(), JournalError> {
        if record.tick < self.boundary {
            return Err(JournalError::BehindBoundary {
                tick: record.tick,
                boundary: self.boundary,
            });
        }

        // An unconfirmed state must stay in front of confirmed states at
        // the same tick; everything else goes after its equal-tick group.
        let unconfirmed_state = record.is_state() && !record.confirmed;

        let mut index = self.records.len();
        while index > 0 {
            let prev = &self.records[index - 1];
            if prev.tick > record.tick {
                index -= 1;
                continue;
            }
            if prev.tick == record.tick && unconfirmed_state && prev.confirmed && prev.is_state() {
                index -= 1;
                continue;
            }
            break;
        }
        self.records.insert(index, record);
        Ok(())
    }

    /// Lazy forward walk over all records with tick in `(from, to]`.
    /// Reversible for the undo pass.
    pub fn iter_range(
        &self,
        from_exclusive: Tick,
        to_inclusive: Tick,
    ) -> impl DoubleEndedIterator<Item = &RewindRecord> {
        let start = self.records.partition_point(|r| r.tick <= from_exclusive);
        let end = self.records.partition_point(|r| r.tick <= to_inclusive);
        self.records[start..end].iter()
    }

    /// All records at exactly `tick`, in journal order.
    pub fn records_at(&self, tick: Tick) -> impl Iterator<Item = &RewindRecord> {
        let start = self.records.partition_point(|r| r.tick < tick);
        let end = self.records.partition_point(|r| r.tick <= tick);
        self.records[start..end].iter()
    }

    /// The state record to restore `rewinder` from at exactly `tick`,
    /// preferring a confirmed one. Relies on the same-tick ordering rule:
    /// the last matching state at the tick is the preferred one.
    pub fn state_at(&self, rewinder: RewinderId, tick: Tick) -> Option<&RewindRecord> {
        self.records_at(tick)
            .filter(|r| r.is_state() && r.rewinder() == rewinder)
            .last()
    }

    /// The state record to restore `rewinder` from at the latest tick at
    /// or before `tick`, preferring a confirmed one at that tick.
    pub fn state_at_or_before(&self, rewinder: RewinderId, tick: Tick) -> Option<&RewindRecord> {
        let latest = self.latest_state_tick(rewinder, tick)?;
        self.state_at(rewinder, latest)
    }

    /// Latest tick at or before `before` holding a state for `rewinder`,
    /// preferring confirmed states over predicted ones.
    fn latest_state_tick(&self, rewinder: RewinderId, before: Tick) -> Option<Tick> {
        let mut latest_any = None;
        for record in self.records.iter().rev() {
            if record.tick > before {
                continue;
            }
            if let RecordKind::State { rewinder: id, .. } = &record.kind {
                if *id != rewinder {
                    continue;
                }
                if record.confirmed {
                    return Some(record.tick);
                }
                if latest_any.is_none() {
                    latest_any = Some(record.tick);
                }
            }
        }
        latest_any
    }

    /// Determines the deepest rewind point for a rewind targeting
    /// `before`: the latest tick at which every registered rewindable has
    /// a state it can be restored from. `None` means some rewindable has
    /// no state at all, and the caller must replay from the journal start.
    pub fn rewind_point(&self, before: Tick, rewinder_count: usize) -> Option<Tick> {
        let mut point = before;
        for id in 0..rewinder_count {
            let tick = self.latest_state_tick(RewinderId(id), before)?;
            point = point.min(tick);
        }
        Some(point)
    }

    /// Bounds memory growth. State records strictly older than `horizon`
    /// are removed once a newer confirmed state exists for the same
    /// rewindable; the last known state of an object is never removed.
    /// Event records are removed only once no future rewind could replay
    /// them, i.e. their tick is older than the oldest state any rewindable
    /// could still be restored from.
    pub fn garbage_collect(&mut self, horizon: Tick, rewinder_count: usize) {
        let before = self.records.len();

        let records = std::mem::take(&mut self.records);
        let mut kept: Vec<RewindRecord> = Vec::with_capacity(records.len());
        for record in records.iter() {
            if let RecordKind::State { rewinder, .. } = &record.kind {
                let obsolete = record.tick < horizon
                    && records.iter().any(|other| {
                        other.confirmed
                            && other.tick > record.tick
                            && matches!(&other.kind,
                                RecordKind::State { rewinder: id, .. } if id == rewinder)
                    });
                if obsolete {
                    continue;
                }
            }
            kept.push(record.clone());
        }
        self.records = kept;

        // Oldest tick any future rewind could still restore from, and the
        // oldest tick at which every rewindable has a state to restore.
        let mut event_horizon = horizon;
        for id in 0..rewinder_count {
            let oldest_state = self
                .records
                .iter()
                .find(|r| r.is_state() && r.rewinder() == RewinderId(id))
                .map(|r| r.tick);
            if let Some(tick) = oldest_state {
                event_horizon = event_horizon.min(tick);
                self.restorable_floor = self.restorable_floor.max(tick);
            }
        }
        self.records
            .retain(|r| !(r.is_event() && r.tick < event_horizon));

        let removed = before - self.records.len();
        if removed > 0 {
            debug!(
                "journal gc: removed {} record(s) below horizon {}, {} left",
                removed,
                horizon,
                self.records.len()
            );
        }
    }

    /// Drops everything, e.g. between races.
    pub fn reset(&mut self) {
        self.records.clear();
        self.boundary = 0;
        self.restorable_floor = 0;
    }
}

impl Default for RewindJournal {
    fn default() -> Self {
        Self::new()
    }
}
