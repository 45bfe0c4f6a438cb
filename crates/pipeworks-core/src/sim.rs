use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, Millis, Ticks};

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Tick counter and accumulated simulated time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    /// Incremented by 1 for each [`crate::engine::Simulation::update`].
    pub tick: Ticks,
    /// Simulated milliseconds since start (after timescale).
    pub time: Millis,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Cosmetic projectile constants for orphaned packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Downward acceleration in px/ms².
    pub gravity: f32,
    /// Fraction of speed kept after a bounce.
    pub restitution: f32,
    /// Orphans are removed once older than this.
    pub max_age_ms: f32,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            gravity: 0.0015,
            restitution: 0.6,
            max_age_ms: 3000.0,
        }
    }
}

/// Global simulation tunables.
///
/// All durations are milliseconds. Loaded from the `config` block of a JSON
/// layout; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Belt travel in pixels per 16 ms of simulated time.
    pub belt_speed: f64,
    /// Multiplier applied to every frame delta.
    pub timescale: f64,
    /// Frame deltas above this are clamped before the timescale is applied.
    pub max_frame_ms: f64,
    /// Fraction of the distance to the cell midline recovered per ms.
    pub center_pull: f64,
    /// A display flushes after this long without input.
    pub display_timeout_ms: f64,
    /// Stored packets that make a TNT machine explode.
    pub tnt_threshold: usize,
    /// Entries kept in a sink's drain ring.
    pub sink_ring_capacity: usize,
    /// Events buffered before the oldest is dropped.
    pub event_capacity: usize,
    /// Cooldown before a failed shell session is reopened.
    pub command_retry_ms: f64,
    pub orphan: OrphanConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            belt_speed: 2.0,
            timescale: 1.0,
            max_frame_ms: 100.0,
            center_pull: 0.01,
            display_timeout_ms: 500.0,
            tnt_threshold: 20,
            sink_ring_capacity: 16,
            event_capacity: 1024,
            command_retry_ms: 1000.0,
            orphan: OrphanConfig::default(),
        }
    }
}

impl SimConfig {
    /// Simulated milliseconds for a wall-clock frame of `frame_ms`.
    ///
    /// Negative and non-finite deltas count as zero.
    pub fn scaled_dt(&self, frame_ms: f64) -> Millis {
        let frame = if frame_ms.is_finite() {
            frame_ms.clamp(0.0, self.max_frame_ms.max(0.0))
        } else {
            0.0
        };
        let scale = if self.timescale.is_finite() {
            self.timescale.max(0.0)
        } else {
            0.0
        };
        Fixed64::saturating_from_num(frame * scale)
    }

    /// Pixels a belt packet travels in `dt`, capped below one cell.
    pub fn belt_step(&self, dt: Millis) -> Fixed64 {
        let speed = Fixed64::saturating_from_num(self.belt_speed.max(0.0))
            .saturating_mul(dt)
            / Fixed64::from_num(16);
        speed.min(Fixed64::from_num(crate::packet::MAX_STEP))
    }

    /// Belt speed as px/ms, for launching orphans.
    pub fn belt_velocity(&self) -> f32 {
        (self.belt_speed / 16.0) as f32
    }
}

// ---------------------------------------------------------------------------
// State hashing
// ---------------------------------------------------------------------------

/// FNV-1a hasher for determinism checks between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    /// Length-prefixed so `"ab" + "c"` and `"a" + "bc"` differ.
    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write(s.as_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::ms;

    #[test]
    fn sim_state_starts_at_zero() {
        let state = SimState::new();
        assert_eq!(state.tick, 0);
        assert_eq!(state.time, Fixed64::ZERO);
    }

    #[test]
    fn frame_is_clamped_before_timescale() {
        let config = SimConfig {
            timescale: 2.0,
            ..SimConfig::default()
        };
        assert_eq!(config.scaled_dt(16.0), ms(32.0));
        assert_eq!(config.scaled_dt(1000.0), ms(200.0));
        assert_eq!(config.scaled_dt(-5.0), Fixed64::ZERO);
        assert_eq!(config.scaled_dt(f64::NAN), Fixed64::ZERO);
    }

    #[test]
    fn belt_step_is_capped_below_a_cell() {
        let config = SimConfig {
            belt_speed: 50.0,
            ..SimConfig::default()
        };
        assert_eq!(config.belt_step(ms(100.0)), Fixed64::from_num(31));
        assert_eq!(SimConfig::default().belt_step(ms(16.0)), Fixed64::from_num(2));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SimConfig = serde_json::from_str(r#"{"belt_speed": 4.0}"#).unwrap();
        assert_eq!(config.belt_speed, 4.0);
        assert_eq!(config.tnt_threshold, 20);
        assert_eq!(config.orphan, OrphanConfig::default());
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_str("AB");

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_str("AB");

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_strings_are_length_prefixed() {
        let mut h1 = StateHash::new();
        h1.write_str("ab");
        h1.write_str("c");

        let mut h2 = StateHash::new();
        h2.write_str("a");
        h2.write_str("bc");

        assert_ne!(h1.finish(), h2.finish());
    }
}
