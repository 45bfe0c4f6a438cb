//! Serialization, layouts and copy-out snapshots.
//!
//! Two binary formats share a versioned header:
//! - a **state** blob ([`Simulation::serialize`]) with every packet, orphan
//!   and machine runtime field, for save/restore and determinism checks;
//! - a **layout** blob ([`Simulation::export_layout`]) with only the grid,
//!   machine configuration and tunables, restored stopped.
//!
//! Shell sessions and event listeners never serialize. A restored simulation
//! starts with no executor and an empty event bus.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::bridge::CommandBridge;
use crate::engine::{Simulation, restore_order};
use crate::event::EventBus;
use crate::grid::{Cell, Grid};
use crate::id::MachineId;
use crate::machine::{Machine, MachineKind};
use crate::orphan::{OrphanedPacket, Viewport};
use crate::packet::Packet;
use crate::sim::{SimConfig, SimState, StateHash};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a full state blob.
pub const STATE_MAGIC: u32 = 0x9195_0001;

/// Magic number identifying a layout blob.
pub const LAYOUT_MAGIC: u32 = 0x9195_0002;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{found:08X}")]
    InvalidMagic { expected: u32, found: u32 },
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("blob from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("grid cell ({x}, {y}) refers to a missing machine")]
    DanglingMachine { x: i32, y: i32 },
    #[error("grid is {width}x{height} but stores {cells} cells")]
    MalformedGrid { width: u32, height: u32, cells: usize },
    #[error("sink at ({x}, {y}) has a malformed ring")]
    MalformedRing { x: i32, y: i32 },
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Prepended to every blob for format detection and version checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    pub magic: u32,
    pub version: u32,
    /// Tick count when the blob was written.
    pub tick: u64,
}

impl BlobHeader {
    fn new(magic: u32, tick: u64) -> Self {
        Self {
            magic,
            version: FORMAT_VERSION,
            tick,
        }
    }

    fn validate(&self, expected: u32) -> Result<(), DeserializeError> {
        if self.magic != expected {
            return Err(DeserializeError::InvalidMagic {
                expected,
                found: self.magic,
            });
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StateBlob {
    header: BlobHeader,
    config: SimConfig,
    grid: Grid,
    machines: SlotMap<MachineId, Machine>,
    order: Vec<MachineId>,
    packets: Vec<Packet>,
    orphans: Vec<OrphanedPacket>,
    sim_state: SimState,
    running: bool,
    next_packet_id: u64,
    viewport: Viewport,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutBlob {
    header: BlobHeader,
    config: SimConfig,
    grid: Grid,
    machines: SlotMap<MachineId, Machine>,
    order: Vec<MachineId>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializeError> {
    bitcode::serialize(value).map_err(|e| SerializeError::Encode(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, DeserializeError> {
    bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))
}

/// The grid must cover its dimensions, every machine cell must point at a
/// live machine, and every sink ring must be usable.
fn check_structure(
    grid: &Grid,
    machines: &SlotMap<MachineId, Machine>,
) -> Result<(), DeserializeError> {
    if !grid.is_consistent() {
        return Err(DeserializeError::MalformedGrid {
            width: grid.width(),
            height: grid.height(),
            cells: grid.cell_count(),
        });
    }
    for machine in machines.values() {
        if let MachineKind::Sink { ring, .. } = &machine.kind {
            if !ring.is_consistent() {
                return Err(DeserializeError::MalformedRing {
                    x: machine.x,
                    y: machine.y,
                });
            }
        }
    }
    for (x, y, cell) in grid.iter() {
        if let Cell::Machine { id } = cell {
            if !machines.contains_key(id) {
                return Err(DeserializeError::DanglingMachine { x, y });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Simulation serialization methods
// ---------------------------------------------------------------------------

impl Simulation {
    /// Serialize the full simulation state to a binary blob via bitcode.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        encode(&StateBlob {
            header: BlobHeader::new(STATE_MAGIC, self.sim_state.tick),
            config: self.config.clone(),
            grid: self.grid.clone(),
            machines: self.machines.clone(),
            order: self.order.clone(),
            packets: self.packets.clone(),
            orphans: self.orphans.clone(),
            sim_state: self.sim_state.clone(),
            running: self.running,
            next_packet_id: self.next_packet_id,
            viewport: self.viewport,
        })
    }

    /// Restore a simulation from [`Simulation::serialize`] output.
    ///
    /// Command machines that were mid-run come back idle: their sessions did
    /// not survive, so in-flight work is dropped.
    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        let blob: StateBlob = decode(data)?;
        blob.header.validate(STATE_MAGIC)?;
        check_structure(&blob.grid, &blob.machines)?;

        let mut machines = blob.machines;
        for command in machines.values_mut().filter_map(Machine::as_command_mut) {
            command.processing = false;
            command.stream_started = false;
            command.run_started_at = None;
            command.status = Default::default();
        }

        Ok(Simulation {
            grid: blob.grid,
            order: restore_order(blob.order, &machines),
            machines,
            packets: blob.packets,
            orphans: blob.orphans,
            event_bus: EventBus::new(blob.config.event_capacity),
            config: blob.config,
            sim_state: blob.sim_state,
            running: blob.running,
            next_packet_id: blob.next_packet_id,
            viewport: blob.viewport,
            bridge: CommandBridge::new(),
        })
    }

    /// Serialize the grid, machine configuration and tunables. Runtime state
    /// is written in its reset form.
    pub fn export_layout(&self) -> Result<Vec<u8>, SerializeError> {
        let mut machines = self.machines.clone();
        for machine in machines.values_mut() {
            machine.reset();
        }
        encode(&LayoutBlob {
            header: BlobHeader::new(LAYOUT_MAGIC, 0),
            config: self.config.clone(),
            grid: self.grid.clone(),
            machines,
            order: self.order.clone(),
        })
    }

    /// Build a stopped simulation from [`Simulation::export_layout`] output.
    pub fn import_layout(data: &[u8]) -> Result<Self, DeserializeError> {
        let blob: LayoutBlob = decode(data)?;
        blob.header.validate(LAYOUT_MAGIC)?;
        check_structure(&blob.grid, &blob.machines)?;

        let mut sim = Simulation::with_config(blob.grid.width(), blob.grid.height(), blob.config);
        sim.grid = blob.grid;
        sim.order = restore_order(blob.order, &blob.machines);
        sim.machines = blob.machines;
        for machine in sim.machines.values_mut() {
            machine.reset();
        }
        Ok(sim)
    }

    // -----------------------------------------------------------------------
    // Snapshots and hashing
    // -----------------------------------------------------------------------

    /// A copy of everything a renderer draws, detached from the simulation.
    pub fn snapshot(&self) -> Snapshot {
        let machines = self
            .machines()
            .map(|(id, m)| MachineSnapshot {
                id,
                name: m.kind.name(),
                x: m.x,
                y: m.y,
                direction: m.direction,
                cells: m.cells(),
                last_command_time: m.last_command_time,
                kind: m.kind.clone(),
            })
            .collect();
        Snapshot {
            tick: self.sim_state.tick,
            time: self.sim_state.time,
            width: self.grid.width(),
            height: self.grid.height(),
            cells: self.grid.iter().map(|(_, _, cell)| cell).collect(),
            machines,
            packets: self.packets.clone(),
            orphans: self.orphans.clone(),
        }
    }

    /// Hash of the deterministic state: time, grid, packets and machine
    /// configuration. Orphans are cosmetic f32 state and are left out.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.sim_state.tick);
        h.write_fixed64(self.sim_state.time);
        h.write_u64(self.next_packet_id);
        for (x, y, cell) in self.grid.iter() {
            match cell {
                Cell::Empty => continue,
                Cell::Belt { direction } => {
                    h.write_i32(x);
                    h.write_i32(y);
                    h.write(&[1, direction.index()]);
                }
                Cell::Machine { .. } => {
                    h.write_i32(x);
                    h.write_i32(y);
                    h.write(&[2]);
                }
            }
        }
        for packet in &self.packets {
            h.write_u64(packet.id.0);
            h.write_i32(packet.x);
            h.write_i32(packet.y);
            h.write_fixed64(packet.offset_x);
            h.write_fixed64(packet.offset_y);
            h.write(&[packet.direction.index(), packet.waiting as u8]);
            h.write_str(&packet.content);
        }
        for machine in self.machines.values() {
            h.write_i32(machine.x);
            h.write_i32(machine.y);
            h.write(&[machine.direction.index()]);
            h.write_str(machine.kind.name());
            if let Some(contents) = machine.sink_contents() {
                for content in &contents {
                    h.write_str(content);
                }
            }
        }
        h.finish()
    }
}

/// One machine as seen by a renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub id: MachineId,
    pub name: &'static str,
    pub x: i32,
    pub y: i32,
    pub direction: crate::direction::Direction,
    pub cells: Vec<(i32, i32)>,
    pub last_command_time: Option<crate::fixed::Millis>,
    pub kind: MachineKind,
}

/// A copy-out view of one frame, safe to hand to another thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: u64,
    pub time: crate::fixed::Millis,
    pub width: u32,
    pub height: u32,
    /// Row-major cells.
    pub cells: Vec<Cell>,
    pub machines: Vec<MachineSnapshot>,
    pub packets: Vec<Packet>,
    pub orphans: Vec<OrphanedPacket>,
}

impl Snapshot {
    pub fn cell(&self, x: i32, y: i32) -> Cell {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return Cell::Empty;
        }
        self.cells[y as usize * self.width as usize + x as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::Direction;
    use crate::test_utils::{run, sink_text, source_to_sink};

    #[test]
    fn state_round_trip_continues_identically() {
        let (mut sim, _, sink) = source_to_sink(MachineKind::source("hey", 100.0, true, 0.0), 3);
        run(&mut sim, 40);

        let blob = sim.serialize().unwrap();
        let mut restored = Simulation::deserialize(&blob).unwrap();
        assert_eq!(restored.state_hash(), sim.state_hash());

        run(&mut sim, 40);
        run(&mut restored, 40);
        assert_eq!(restored.state_hash(), sim.state_hash());
        assert_eq!(sink_text(&restored, sink), sink_text(&sim, sink));
    }

    #[test]
    fn layout_round_trip_comes_back_stopped_and_reset() {
        let (mut sim, src, sink) = source_to_sink(MachineKind::source("AB", 100.0, false, 0.0), 2);
        run(&mut sim, 100);
        assert_eq!(sink_text(&sim, sink), "AB");

        let blob = sim.export_layout().unwrap();
        let mut restored = Simulation::import_layout(&blob).unwrap();
        assert!(!restored.is_running());
        assert!(restored.packets().is_empty());
        assert_eq!(sink_text(&restored, sink), "");
        assert_eq!(restored.machine(src).unwrap().direction, Direction::Right);

        restored.start();
        run(&mut restored, 100);
        assert_eq!(sink_text(&restored, sink), "AB");
    }

    #[test]
    fn placement_order_survives_both_formats() {
        let mut sim = Simulation::new(3, 1);
        let first = sim
            .place_machine(0, 0, Direction::Right, MachineKind::Null)
            .unwrap();
        let second = sim
            .place_machine(1, 0, Direction::Right, MachineKind::Null)
            .unwrap();
        sim.remove_machine(first);
        let third = sim
            .place_machine(2, 0, Direction::Right, MachineKind::Null)
            .unwrap();
        let expected = vec![second, third];

        let layout = Simulation::import_layout(&sim.export_layout().unwrap()).unwrap();
        let ids: Vec<MachineId> = layout.machines().map(|(id, _)| id).collect();
        assert_eq!(ids, expected);

        let state = Simulation::deserialize(&sim.serialize().unwrap()).unwrap();
        let ids: Vec<MachineId> = state.snapshot().machines.iter().map(|m| m.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let sim = Simulation::new(2, 2);
        let layout = sim.export_layout().unwrap();
        let err = Simulation::deserialize(&layout).unwrap_err();
        assert!(matches!(
            err,
            DeserializeError::InvalidMagic {
                expected: STATE_MAGIC,
                found: LAYOUT_MAGIC
            }
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Simulation::import_layout(&[1, 2, 3]),
            Err(DeserializeError::Decode(_))
        ));
    }

    /// Same wire shape as [`Grid`], with the cell count left free.
    #[derive(Serialize)]
    struct RawGrid {
        width: u32,
        height: u32,
        cells: Vec<Cell>,
    }

    #[derive(Serialize)]
    struct RawLayout {
        header: BlobHeader,
        config: SimConfig,
        grid: RawGrid,
        machines: SlotMap<MachineId, Machine>,
        order: Vec<MachineId>,
    }

    #[test]
    fn grid_with_missing_cells_is_rejected() {
        let blob = bitcode::serialize(&RawLayout {
            header: BlobHeader::new(LAYOUT_MAGIC, 0),
            config: SimConfig::default(),
            grid: RawGrid {
                width: 4,
                height: 4,
                cells: Vec::new(),
            },
            machines: SlotMap::with_key(),
            order: Vec::new(),
        })
        .unwrap();
        assert!(matches!(
            Simulation::import_layout(&blob),
            Err(DeserializeError::MalformedGrid {
                width: 4,
                height: 4,
                cells: 0
            })
        ));
    }

    #[test]
    fn grid_with_extra_cells_is_rejected() {
        let blob = bitcode::serialize(&RawLayout {
            header: BlobHeader::new(LAYOUT_MAGIC, 0),
            config: SimConfig::default(),
            grid: RawGrid {
                width: 1,
                height: 1,
                cells: vec![Cell::Empty; 3],
            },
            machines: SlotMap::with_key(),
            order: Vec::new(),
        })
        .unwrap();
        let err = Simulation::import_layout(&blob).unwrap_err();
        assert!(err.to_string().contains("stores 3 cells"));
    }

    #[test]
    fn header_version_checks() {
        let mut header = BlobHeader::new(STATE_MAGIC, 0);
        header.version = FORMAT_VERSION + 1;
        assert!(matches!(
            header.validate(STATE_MAGIC),
            Err(DeserializeError::FutureVersion(_))
        ));
        header.version = 0;
        assert!(matches!(
            header.validate(STATE_MAGIC),
            Err(DeserializeError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn snapshot_copies_render_state() {
        let (mut sim, src, _) = source_to_sink(MachineKind::source("A", 100.0, false, 0.0), 2);
        run(&mut sim, 3);
        let snap = sim.snapshot();
        assert_eq!(snap.packets.len(), sim.packets().len());
        assert_eq!(snap.cell(0, 0), Cell::Machine { id: src });
        assert_eq!(snap.cell(-1, 0), Cell::Empty);
        assert!(snap.machines.iter().any(|m| m.id == src && m.name == "source"));
    }

    #[test]
    fn hash_differs_after_progress() {
        let (mut sim, _, _) = source_to_sink(MachineKind::source("A", 100.0, false, 0.0), 2);
        let before = sim.state_hash();
        run(&mut sim, 5);
        assert_ne!(sim.state_hash(), before);
    }
}
