//! Cardinal directions and their modulo-4 rotation arithmetic.

use serde::{Deserialize, Serialize};

/// One of the four cardinal directions, in clockwise order.
///
/// Screen coordinates: `y` grows downward, so `Down` is `(0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Right = 0,
    Down = 1,
    Left = 2,
    Up = 3,
}

impl Direction {
    /// All directions in clockwise order starting at `Right`.
    pub const ALL: [Direction; 4] = [
        Direction::Right,
        Direction::Down,
        Direction::Left,
        Direction::Up,
    ];

    /// Build a direction from any integer index, wrapping modulo 4.
    pub fn from_index(index: u8) -> Self {
        Self::ALL[(index % 4) as usize]
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Unit `(dx, dy)` step for this direction.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Right => (1, 0),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Up => (0, -1),
        }
    }

    pub fn rotate_cw(self) -> Self {
        self.rotated(1)
    }

    pub fn rotate_ccw(self) -> Self {
        self.rotated(3)
    }

    /// Rotate clockwise by `steps` quarter turns.
    pub fn rotated(self, steps: u8) -> Self {
        Self::from_index(self.index().wrapping_add(steps % 4))
    }

    pub fn opposite(self) -> Self {
        self.rotated(2)
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Right | Direction::Left)
    }
}
