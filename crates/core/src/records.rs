use tracing::warn;

/// Reference-count entry for one in-flight hardware buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub buffer_id: u32,
    pub ref_count: u32,
}

/// Outcome of releasing one reference on a tracked buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other clients still hold the buffer.
    Retained,
    /// The last reference was dropped; the caller returns the buffer to
    /// hardware.
    Returnable,
    /// The buffer id is not tracked.
    Unknown,
}

/// Compact table mapping hardware buffer id to its outstanding reference
/// count.
///
/// A record with `ref_count == 0` is a reusable slot; a live buffer id
/// appears at most once.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::{FrameRecordTable, Release};
///
/// let mut table = FrameRecordTable::new();
/// table.track(7, 2);
/// assert_eq!(table.release(7), Release::Retained);
/// assert_eq!(table.release(7), Release::Returnable);
/// ```
#[derive(Debug, Default)]
pub struct FrameRecordTable {
    records: Vec<FrameRecord>,
}

impl FrameRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a buffer with the given reference count, reusing the first dead
    /// slot or appending.
    pub fn track(&mut self, buffer_id: u32, ref_count: u32) {
        match self.records.iter_mut().find(|rec| rec.ref_count == 0) {
            Some(slot) => {
                slot.buffer_id = buffer_id;
                slot.ref_count = ref_count;
            }
            None => self.records.push(FrameRecord {
                buffer_id,
                ref_count,
            }),
        }
    }

    /// Drop one reference on `buffer_id`.
    ///
    /// An unknown id is logged and reported, never escalated.
    pub fn release(&mut self, buffer_id: u32) -> Release {
        let Some(rec) = self
            .records
            .iter_mut()
            .find(|rec| rec.ref_count > 0 && rec.buffer_id == buffer_id)
        else {
            warn!(buffer_id, "received a frame back with an unrecognized id");
            return Release::Unknown;
        };
        rec.ref_count -= 1;
        if rec.ref_count == 0 {
            Release::Returnable
        } else {
            Release::Retained
        }
    }

    /// Keep only live records and reserve room for `capacity` entries.
    ///
    /// Live records are never discarded; more live records than `capacity`
    /// can legitimately occur mid-flight and is only warned about.
    pub fn compact(&mut self, capacity: usize) {
        let mut live: Vec<FrameRecord> = Vec::with_capacity(capacity);
        live.extend(self.records.iter().copied().filter(|rec| rec.ref_count > 0));
        if live.len() > capacity {
            warn!(
                live = live.len(),
                capacity, "more frames in use than the negotiated pool size"
            );
        }
        self.records = live;
    }

    /// Number of records with outstanding references.
    pub fn live(&self) -> usize {
        self.records.iter().filter(|rec| rec.ref_count > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_counts_down_to_returnable() {
        let mut table = FrameRecordTable::new();
        table.track(9, 3);
        assert_eq!(table.release(9), Release::Retained);
        assert_eq!(table.release(9), Release::Retained);
        assert_eq!(table.release(9), Release::Returnable);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn unknown_buffer_is_soft() {
        let mut table = FrameRecordTable::new();
        assert_eq!(table.release(42), Release::Unknown);
    }

    #[test]
    fn track_reuses_dead_slots() {
        let mut table = FrameRecordTable::new();
        table.track(1, 1);
        table.track(2, 1);
        assert_eq!(table.release(1), Release::Returnable);
        table.track(3, 2);
        // Slot for buffer 1 was reused rather than growing the table.
        assert_eq!(table.records.len(), 2);
        assert_eq!(table.records[0].buffer_id, 3);
    }

    #[test]
    fn compact_keeps_live_records() {
        let mut table = FrameRecordTable::new();
        table.track(1, 1);
        table.track(2, 2);
        table.release(1);
        table.compact(4);
        assert_eq!(table.live(), 1);
        assert_eq!(table.release(2), Release::Retained);
    }

    #[test]
    fn compact_tolerates_overshoot() {
        let mut table = FrameRecordTable::new();
        table.track(1, 1);
        table.track(2, 1);
        table.track(3, 1);
        table.compact(1);
        assert_eq!(table.live(), 3);
    }
}
