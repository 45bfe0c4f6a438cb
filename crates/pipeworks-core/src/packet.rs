//! Packets in transit and the occupancy queries built on them.
//!
//! A packet lives in one cell at a time. Its sub-cell position is an offset
//! in `0..=CELL_SIZE` on each axis, measured from the cell's top-left corner.
//! Progress through a cell is measured along the packet's travel direction:
//! 0 at the entry edge, 1 at the exit edge.

use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::fixed::Fixed64;
use crate::id::PacketId;

/// Cell edge length in pixels.
pub const CELL_SIZE: i32 = 32;

/// Largest per-tick travel. Strictly below one cell so a packet can never
/// step over a boundary or another packet.
pub const MAX_STEP: i32 = CELL_SIZE - 1;

/// A packet whose progress through its cell is below 4/10 holds the cell's
/// "front". At most one packet may hold a given cell's front.
pub fn is_front_progress(progress: Fixed64) -> bool {
    // progress < 0.4, kept exact in fixed point
    progress * Fixed64::from_num(5) < Fixed64::from_num(2)
}

#[inline]
pub fn cell_size() -> Fixed64 {
    Fixed64::from_num(CELL_SIZE)
}

#[inline]
fn half_cell() -> Fixed64 {
    Fixed64::from_num(CELL_SIZE / 2)
}

/// One character (or, for packer payloads, several) in transit on the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub x: i32,
    pub y: i32,
    pub offset_x: Fixed64,
    pub offset_y: Fixed64,
    pub content: String,
    pub direction: Direction,
    /// Blocked at the exit edge by a packet holding the next cell's front.
    pub waiting: bool,
}

impl Packet {
    /// A packet placed at the entry edge of `(x, y)`, travelling `direction`.
    pub fn entering(id: PacketId, x: i32, y: i32, direction: Direction, content: String) -> Self {
        let mut packet = Self::centered(id, x, y, direction, content);
        packet.set_along(Fixed64::ZERO);
        packet
    }

    /// A packet placed just inside the exit edge of `(x, y)`. It crosses into
    /// the next cell on its first move.
    pub fn leaving(id: PacketId, x: i32, y: i32, direction: Direction, content: String) -> Self {
        let mut packet = Self::centered(id, x, y, direction, content);
        packet.clamp_to_exit();
        packet
    }

    fn centered(id: PacketId, x: i32, y: i32, direction: Direction, content: String) -> Self {
        Self {
            id,
            x,
            y,
            offset_x: half_cell(),
            offset_y: half_cell(),
            content,
            direction,
            waiting: false,
        }
    }

    /// Distance travelled through the cell along `direction`, in pixels.
    pub fn along(&self) -> Fixed64 {
        match self.direction {
            Direction::Right => self.offset_x,
            Direction::Down => self.offset_y,
            Direction::Left => cell_size() - self.offset_x,
            Direction::Up => cell_size() - self.offset_y,
        }
    }

    /// Set the distance travelled along `direction`.
    pub fn set_along(&mut self, along: Fixed64) {
        match self.direction {
            Direction::Right => self.offset_x = along,
            Direction::Down => self.offset_y = along,
            Direction::Left => self.offset_x = cell_size() - along,
            Direction::Up => self.offset_y = cell_size() - along,
        }
    }

    /// Park just inside the exit edge (offset `CELL_SIZE - 1` or `1`).
    pub fn clamp_to_exit(&mut self) {
        self.set_along(Fixed64::from_num(CELL_SIZE - 1));
    }

    /// Progress through the current cell, 0 at entry and 1 at exit.
    pub fn progress(&self) -> Fixed64 {
        self.along() / cell_size()
    }

    pub fn is_front(&self) -> bool {
        is_front_progress(self.progress())
    }

    /// Offset perpendicular to travel.
    pub fn cross(&self) -> Fixed64 {
        if self.direction.is_horizontal() {
            self.offset_y
        } else {
            self.offset_x
        }
    }

    pub fn set_cross(&mut self, cross: Fixed64) {
        if self.direction.is_horizontal() {
            self.offset_y = cross;
        } else {
            self.offset_x = cross;
        }
    }

    /// Pixel position of the packet in world space.
    pub fn world_position(&self) -> (Fixed64, Fixed64) {
        (
            Fixed64::from_num(self.x * CELL_SIZE) + self.offset_x,
            Fixed64::from_num(self.y * CELL_SIZE) + self.offset_y,
        )
    }
}

/// True when no packet currently sits in `(x, y)`.
pub fn is_cell_empty(packets: &[Packet], x: i32, y: i32) -> bool {
    !packets.iter().any(|p| p.x == x && p.y == y)
}

/// True when a packet other than `except` holds the front of `(x, y)`.
pub fn is_front_occupied(packets: &[Packet], x: i32, y: i32, except: Option<PacketId>) -> bool {
    packets
        .iter()
        .any(|p| p.x == x && p.y == y && Some(p.id) != except && p.is_front())
}
