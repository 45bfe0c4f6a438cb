//! Cosmetic projectile motion for packets that left the grid.
//!
//! Nothing in the simulation reads orphan state back; orphans only need to
//! move plausibly and disappear eventually. Plain `f32` is used here because
//! explosions need trigonometry.

use serde::{Deserialize, Serialize};

use crate::id::PacketId;
use crate::sim::OrphanConfig;

/// A packet in free flight, in world pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedPacket {
    pub id: PacketId,
    pub world_x: f32,
    pub world_y: f32,
    /// Velocity in px/ms.
    pub vx: f32,
    pub vy: f32,
    pub content: String,
    /// Milliseconds since the packet was orphaned.
    pub age: f32,
}

impl OrphanedPacket {
    pub fn new(id: PacketId, (world_x, world_y): (f32, f32), (vx, vy): (f32, f32), content: String) -> Self {
        Self {
            id,
            world_x,
            world_y,
            vx,
            vy,
            content,
            age: 0.0,
        }
    }
}

/// World-space rectangle that orphans bounce inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Viewport {
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
}

/// Reflect `pos`/`vel` off `[min, max]`, scaling speed by `restitution`.
fn bounce(pos: &mut f32, vel: &mut f32, min: f32, max: f32, restitution: f32) {
    if *pos < min {
        *pos = min;
        *vel = vel.abs() * restitution;
    } else if *pos > max {
        *pos = max;
        *vel = -vel.abs() * restitution;
    }
}

/// Integrate every orphan by `dt_ms` and drop those past their maximum age.
/// Returns how many were removed.
pub fn step_orphans(
    orphans: &mut Vec<OrphanedPacket>,
    dt_ms: f32,
    viewport: &Viewport,
    config: &OrphanConfig,
) -> usize {
    for orphan in orphans.iter_mut() {
        orphan.vy += config.gravity * dt_ms;
        orphan.world_x += orphan.vx * dt_ms;
        orphan.world_y += orphan.vy * dt_ms;
        bounce(
            &mut orphan.world_x,
            &mut orphan.vx,
            viewport.min_x,
            viewport.max_x,
            config.restitution,
        );
        bounce(
            &mut orphan.world_y,
            &mut orphan.vy,
            viewport.min_y,
            viewport.max_y,
            config.restitution,
        );
        orphan.age += dt_ms;
    }

    let before = orphans.len();
    orphans.retain(|o| o.age <= config.max_age_ms);
    before - orphans.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> Viewport {
        Viewport::new(0.0, 0.0, 100.0, 100.0)
    }

    fn orphan(vx: f32, vy: f32) -> OrphanedPacket {
        OrphanedPacket::new(PacketId(1), (50.0, 50.0), (vx, vy), "x".into())
    }

    #[test]
    fn gravity_accelerates_downward() {
        let config = OrphanConfig::default();
        let mut orphans = vec![orphan(0.0, 0.0)];
        step_orphans(&mut orphans, 10.0, &viewport(), &config);
        assert!(orphans[0].vy > 0.0);
        assert!(orphans[0].world_y > 50.0);
        assert_eq!(orphans[0].world_x, 50.0);
    }

    #[test]
    fn bounces_off_walls_with_restitution() {
        let config = OrphanConfig {
            gravity: 0.0,
            ..OrphanConfig::default()
        };
        let mut orphans = vec![orphan(10.0, 0.0)];
        step_orphans(&mut orphans, 10.0, &viewport(), &config);
        let o = &orphans[0];
        assert_eq!(o.world_x, 100.0);
        assert!((o.vx + 6.0).abs() < 1e-5);
    }

    #[test]
    fn expires_after_max_age() {
        let config = OrphanConfig {
            max_age_ms: 100.0,
            ..OrphanConfig::default()
        };
        let mut orphans = vec![orphan(0.0, 0.0)];
        assert_eq!(step_orphans(&mut orphans, 60.0, &viewport(), &config), 0);
        assert_eq!(step_orphans(&mut orphans, 60.0, &viewport(), &config), 1);
        assert!(orphans.is_empty());
    }
}
