use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a machine in the engine's arena. Grid cells store this
    /// handle, never the machine itself, so a two-cell splitter is simply two
    /// cells holding the same id.
    pub struct MachineId;
}

/// Identifies a packet. Allocated monotonically and never reused within a
/// run; orphaned packets keep the id they had on the belt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u64);

/// A wireless channel. Wireless machines on the same channel hear each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn packet_ids_order_by_allocation() {
        let a = PacketId(1);
        let b = PacketId(2);
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn machine_ids_are_stable_handles() {
        let mut arena: SlotMap<MachineId, &str> = SlotMap::with_key();
        let a = arena.insert("source");
        let b = arena.insert("sink");
        arena.remove(a);
        assert_eq!(arena[b], "sink");
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn channel_ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ChannelId(7), "north");
        assert_eq!(map[&ChannelId(7)], "north");
    }
}
