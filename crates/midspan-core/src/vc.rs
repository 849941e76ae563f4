//! Virtual-connection table.
//!
//! A transaction tracks every byte-oriented endpoint it touches (client,
//! origin, transforms, push targets) in a small fixed-capacity table.
//! Entries are created as endpoints appear and destroyed only through
//! [`VcTable::cleanup_entry`], which cancels the VIOs, releases the write
//! buffer, and frees the slot. The teardown path is the single place an
//! endpoint can disappear from the transaction.

use bytes::BytesMut;

/// Runtime identifier of the underlying connection or pipe.
pub type VcKey = u64;

/// Index of an entry within the table.
pub type VcEntryId = usize;

/// What kind of endpoint an entry wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcType {
    /// Inbound client connection
    Client,
    /// Outbound origin connection
    Origin,
    /// Body transform (consumer and producer at once)
    Transform,
    /// Push destination
    Push,
}

/// Which state-machine handler consumes this entry's I/O events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcHandler {
    /// Events are unexpected
    #[default]
    None,
    /// Request-side header/body reads
    RequestRead,
    /// Origin response reads
    ResponseRead,
    /// Events belong to the tunnel
    Tunnel,
}

/// One in-flight I/O operation on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vio {
    /// Total bytes the operation wants; `None` is unbounded
    pub nbytes: Option<u64>,
    /// Bytes moved so far
    pub ndone: u64,
    /// Whether the operation is armed
    pub active: bool,
}

impl Vio {
    /// Arm an operation for `nbytes` (None = until EOS).
    #[must_use]
    pub fn armed(nbytes: Option<u64>) -> Self {
        Self { nbytes, ndone: 0, active: true }
    }

    /// Cancel the operation; completion events must stop.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True once `ndone` reached `nbytes`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.nbytes.is_some_and(|total| self.ndone >= total)
    }
}

/// One tracked endpoint.
#[derive(Debug)]
pub struct VcEntry {
    /// Runtime connection key
    pub vc: VcKey,
    /// Endpoint kind
    pub vc_type: VcType,
    /// In-flight read
    pub read_vio: Vio,
    /// In-flight write
    pub write_vio: Vio,
    /// Owned by the tunnel right now
    pub in_tunnel: bool,
    /// End-of-stream observed
    pub eos: bool,
    /// Handler for read completions
    pub read_handler: VcHandler,
    /// Handler for write completions
    pub write_handler: VcHandler,
    /// Pending outbound bytes
    pub write_buffer: BytesMut,
}

/// Fixed-capacity endpoint table.
#[derive(Debug, Default)]
pub struct VcTable {
    entries: [Option<VcEntry>; VcTable::CAPACITY],
}

impl VcTable {
    /// Maximum simultaneous endpoints per transaction.
    pub const CAPACITY: usize = 8;

    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry for `vc`. Returns `None` when the table is full.
    pub fn new_entry(&mut self, vc: VcKey, vc_type: VcType) -> Option<VcEntryId> {
        let slot = self.entries.iter().position(Option::is_none)?;
        self.entries[slot] = Some(VcEntry {
            vc,
            vc_type,
            read_vio: Vio::default(),
            write_vio: Vio::default(),
            in_tunnel: false,
            eos: false,
            read_handler: VcHandler::None,
            write_handler: VcHandler::None,
            write_buffer: BytesMut::new(),
        });
        Some(slot)
    }

    /// Entry by id.
    #[must_use]
    pub fn get(&self, id: VcEntryId) -> Option<&VcEntry> {
        self.entries.get(id)?.as_ref()
    }

    /// Mutable entry by id.
    pub fn get_mut(&mut self, id: VcEntryId) -> Option<&mut VcEntry> {
        self.entries.get_mut(id)?.as_mut()
    }

    /// Find the entry wrapping the runtime key `vc`.
    #[must_use]
    pub fn find(&self, vc: VcKey) -> Option<VcEntryId> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.vc == vc))
    }

    /// Cancel the entry's VIOs, drop its buffer, and free the slot.
    /// Returns the runtime key so the caller can close the connection.
    pub fn cleanup_entry(&mut self, id: VcEntryId) -> Option<VcKey> {
        let mut entry = self.entries.get_mut(id)?.take()?;
        entry.read_vio.clear();
        entry.write_vio.clear();
        Some(entry.vc)
    }

    /// Live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// True when no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live entry ids.
    pub fn ids(&self) -> impl Iterator<Item = VcEntryId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_find_cleanup() {
        let mut table = VcTable::new();
        let id = table.new_entry(42, VcType::Client).unwrap();
        assert_eq!(table.find(42), Some(id));
        assert_eq!(table.len(), 1);

        assert_eq!(table.cleanup_entry(id), Some(42));
        assert_eq!(table.find(42), None);
        assert!(table.is_empty());
        // Double cleanup is a no-op
        assert_eq!(table.cleanup_entry(id), None);
    }

    #[test]
    fn capacity_enforced() {
        let mut table = VcTable::new();
        for i in 0..VcTable::CAPACITY {
            assert!(table.new_entry(i as VcKey, VcType::Transform).is_some());
        }
        assert!(table.new_entry(99, VcType::Push).is_none());

        // Freeing a slot makes room again
        let id = table.find(3).unwrap();
        table.cleanup_entry(id);
        assert!(table.new_entry(99, VcType::Push).is_some());
    }

    #[test]
    fn vio_completion() {
        let mut vio = Vio::armed(Some(100));
        assert!(vio.active);
        assert!(!vio.is_complete());
        vio.ndone = 100;
        assert!(vio.is_complete());

        vio.clear();
        assert!(!vio.active);
        assert_eq!(vio.ndone, 0);
    }

    #[test]
    fn unbounded_vio_never_completes() {
        let mut vio = Vio::armed(None);
        vio.ndone = u64::MAX;
        assert!(!vio.is_complete());
    }
}
