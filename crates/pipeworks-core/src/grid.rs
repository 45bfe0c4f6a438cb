//! The grid/cell model: a fixed-size rectangle of cells.
//!
//! Pure lookup and mutation. Cells never own machines; a machine cell holds a
//! [`MachineId`] into the engine's arena. Packet occupancy is not tracked
//! here (see [`crate::packet::is_cell_empty`]).

use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::id::MachineId;

/// Contents of a single grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cell {
    #[default]
    Empty,
    /// A passive conveyor carrying packets toward `direction`.
    Belt { direction: Direction },
    /// A (possibly shared) reference to a machine.
    Machine { id: MachineId },
}

/// Errors from grid edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("cell ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

/// Rectangular array of cells, row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
}

impl Grid {
    /// Create an all-empty grid.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![Cell::Empty; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of stored cells. Equals `width * height` for any grid built
    /// through [`Grid::new`].
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// False when the stored cells do not cover exactly `width * height`,
    /// which only a corrupt blob can produce.
    pub fn is_consistent(&self) -> bool {
        self.cells.len() as u64 == self.width as u64 * self.height as u64
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        self.in_bounds(x, y)
            .then(|| y as usize * self.width as usize + x as usize)
    }

    /// Look up a cell. Out-of-bounds coordinates read as [`Cell::Empty`].
    pub fn cell(&self, x: i32, y: i32) -> Cell {
        self.index(x, y).map_or(Cell::Empty, |i| self.cells[i])
    }

    /// Overwrite a cell.
    pub fn set_cell(&mut self, x: i32, y: i32, cell: Cell) -> Result<(), GridError> {
        let index = self.index(x, y).ok_or(GridError::OutOfBounds {
            x,
            y,
            width: self.width,
            height: self.height,
        })?;
        self.cells[index] = cell;
        Ok(())
    }

    /// The machine referenced by a cell, if any.
    pub fn machine_at(&self, x: i32, y: i32) -> Option<MachineId> {
        match self.cell(x, y) {
            Cell::Machine { id } => Some(id),
            _ => None,
        }
    }

    /// Coordinates one step from `(x, y)` toward `dir`.
    pub fn neighbor(x: i32, y: i32, dir: Direction) -> (i32, i32) {
        let (dx, dy) = dir.delta();
        (x + dx, y + dy)
    }

    /// True when the neighbor toward `dir` is a belt carrying packets further
    /// toward `dir`, i.e. a valid output belt for a machine at `(x, y)`.
    pub fn outgoing_belt(&self, x: i32, y: i32, dir: Direction) -> bool {
        let (nx, ny) = Self::neighbor(x, y, dir);
        matches!(self.cell(nx, ny), Cell::Belt { direction } if direction == dir)
    }

    /// Every cell pointing at `id`.
    pub fn cells_of(&self, id: MachineId) -> Vec<(i32, i32)> {
        self.iter()
            .filter(|(_, _, cell)| *cell == Cell::Machine { id })
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    /// Replace every cell pointing at `id` with [`Cell::Empty`].
    pub fn clear_machine(&mut self, id: MachineId) {
        for cell in &mut self.cells {
            if *cell == (Cell::Machine { id }) {
                *cell = Cell::Empty;
            }
        }
    }

    /// Iterate `(x, y, cell)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32, Cell)> + '_ {
        let width = self.width as usize;
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, cell)| ((i % width) as i32, (i / width) as i32, *cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn out_of_bounds_reads_empty() {
        let grid = Grid::new(3, 2);
        assert_eq!(grid.cell(-1, 0), Cell::Empty);
        assert_eq!(grid.cell(3, 0), Cell::Empty);
        assert_eq!(grid.cell(0, 2), Cell::Empty);
    }

    #[test]
    fn set_cell_rejects_out_of_bounds() {
        let mut grid = Grid::new(3, 2);
        let err = grid
            .set_cell(5, 1, Cell::Belt { direction: Direction::Right })
            .unwrap_err();
        assert_eq!(
            err,
            GridError::OutOfBounds { x: 5, y: 1, width: 3, height: 2 }
        );
        assert!(err.to_string().contains("3x2"));
    }

    #[test]
    fn set_and_get_belt() {
        let mut grid = Grid::new(4, 4);
        grid.set_cell(2, 3, Cell::Belt { direction: Direction::Up }).unwrap();
        assert_eq!(grid.cell(2, 3), Cell::Belt { direction: Direction::Up });
        assert_eq!(grid.cell(3, 2), Cell::Empty);
    }

    #[test]
    fn outgoing_belt_requires_matching_direction() {
        let mut grid = Grid::new(4, 1);
        grid.set_cell(1, 0, Cell::Belt { direction: Direction::Right }).unwrap();
        assert!(grid.outgoing_belt(0, 0, Direction::Right));

        grid.set_cell(1, 0, Cell::Belt { direction: Direction::Left }).unwrap();
        assert!(!grid.outgoing_belt(0, 0, Direction::Right));
        assert!(!grid.outgoing_belt(0, 0, Direction::Down));
    }

    #[test]
    fn new_grids_are_consistent() {
        assert!(Grid::new(4, 3).is_consistent());
        assert_eq!(Grid::new(4, 3).cell_count(), 12);
        let short = Grid {
            width: 4,
            height: 4,
            cells: Vec::new(),
        };
        assert!(!short.is_consistent());
    }

    #[test]
    fn shared_machine_cells() {
        let mut ids: SlotMap<MachineId, ()> = SlotMap::with_key();
        let id = ids.insert(());
        let mut grid = Grid::new(3, 3);
        grid.set_cell(1, 1, Cell::Machine { id }).unwrap();
        grid.set_cell(1, 2, Cell::Machine { id }).unwrap();

        assert_eq!(grid.cells_of(id), vec![(1, 1), (1, 2)]);
        assert_eq!(grid.machine_at(1, 2), Some(id));

        grid.clear_machine(id);
        assert!(grid.cells_of(id).is_empty());
    }
}
