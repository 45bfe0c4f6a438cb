//! Packet motion: advance, cross, resolve entry.
//!
//! Packets are processed sequentially in list order, so a packet that moved
//! earlier in the pass is seen at its new position by later ones.

use slotmap::SlotMap;

use crate::dispatch::{self, Frame};
use crate::event::Event;
use crate::fixed::{Fixed64, fixed64_to_f32, f64_to_fixed64};
use crate::grid::{Cell, Grid};
use crate::id::{MachineId, PacketId};
use crate::machine::Machine;
use crate::orphan::OrphanedPacket;
use crate::packet::{Packet, cell_size, is_front_occupied};

/// What happened to the packets during one motion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionStats {
    pub consumed: usize,
    pub orphaned: usize,
}

/// Advance every packet with `id < fresh_from` by one tick. Packets emitted
/// this frame (ids at or above `fresh_from`) first move next frame.
pub(crate) fn advance_packets(
    frame: &mut Frame<'_>,
    machines: &mut SlotMap<MachineId, Machine>,
    fresh_from: PacketId,
) -> MotionStats {
    let mut stats = MotionStats::default();
    let step = frame.config.belt_step(frame.dt);
    let pull = (f64_to_fixed64(frame.config.center_pull.max(0.0)) * frame.dt).min(Fixed64::ONE);
    let half = cell_size() / Fixed64::from_num(2);

    let mut i = 0;
    while i < frame.packets.len() {
        if frame.packets[i].id >= fresh_from {
            i += 1;
            continue;
        }

        let packet = &mut frame.packets[i];
        packet.set_along(packet.along() + step);
        let cross = packet.cross();
        packet.set_cross(cross + (half - cross) * pull);

        let Some(((nx, ny), wrapped)) = crossing(packet) else {
            i += 1;
            continue;
        };

        let (id, dir) = (packet.id, packet.direction);
        match frame.grid.cell(nx, ny) {
            Cell::Empty => {
                let packet = frame.packets.remove(i);
                orphan(frame, packet);
                stats.orphaned += 1;
            }
            Cell::Machine { id: machine } => {
                let packet = frame.packets.remove(i);
                if dispatch::deliver(frame, machines, machine, &packet.content, dir.opposite()) {
                    stats.consumed += 1;
                } else {
                    orphan(frame, packet);
                    stats.orphaned += 1;
                }
            }
            Cell::Belt { direction } => {
                if is_front_occupied(&frame.packets, nx, ny, Some(id)) {
                    let packet = &mut frame.packets[i];
                    packet.clamp_to_exit();
                    packet.waiting = true;
                } else {
                    let packet = &mut frame.packets[i];
                    packet.x = nx;
                    packet.y = ny;
                    packet.offset_x = wrapped.0;
                    packet.offset_y = wrapped.1;
                    packet.direction = direction;
                    packet.waiting = false;
                }
                i += 1;
            }
        }
    }
    stats
}

/// If the packet crossed the boundary ahead of it, the target cell and the
/// offsets wrapped into that cell.
fn crossing(packet: &Packet) -> Option<((i32, i32), (Fixed64, Fixed64))> {
    let size = cell_size();
    let (mut ox, mut oy) = (packet.offset_x, packet.offset_y);
    let axis = if packet.direction.is_horizontal() {
        &mut ox
    } else {
        &mut oy
    };
    if *axis >= size {
        *axis -= size;
    } else if *axis < Fixed64::ZERO {
        *axis += size;
    } else {
        return None;
    }
    Some((Grid::neighbor(packet.x, packet.y, packet.direction), (ox, oy)))
}

/// Hand a packet to the orphan physics, keeping its id.
pub(crate) fn orphan(frame: &mut Frame<'_>, packet: Packet) {
    let (wx, wy) = packet.world_position();
    let (dx, dy) = packet.direction.delta();
    let speed = frame.config.belt_velocity();
    frame.events.emit(Event::PacketOrphaned {
        packet: packet.id,
        tick: frame.tick,
    });
    frame.orphans.push(OrphanedPacket::new(
        packet.id,
        (fixed64_to_f32(wx), fixed64_to_f32(wy)),
        (dx as f32 * speed, dy as f32 * speed),
        packet.content,
    ));
}
