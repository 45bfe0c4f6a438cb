//! Pipeworks Core -- the simulation core for a Unix-pipe factory game.
//!
//! Packets carrying single characters ride conveyor belts across a grid and
//! pass through machines that generate, route, transform and consume them.
//! A command machine pipes its input through a real shell command.
//!
//! # Frame Pipeline
//!
//! Each call to [`engine::Simulation::update`] advances the simulation by one
//! frame through the following steps:
//!
//! 1. **Emit** -- Every machine tries to place one packet on its outputs.
//! 2. **Delay flush** -- Delay machines release entries that aged out.
//! 3. **Shell** -- Command machines exchange data with their shell sessions
//!    without blocking.
//! 4. **Motion** -- Packets advance, cross cells and enter machines; packets
//!    with nowhere to go become orphans.
//! 5. **Orphans** -- Cosmetic projectile physics for fallen packets.
//!
//! # Key Types
//!
//! - [`engine::Simulation`] -- The simulation context and frame loop.
//! - [`grid::Grid`] -- Cells holding belts or machine handles.
//! - [`machine::MachineKind`] -- Every machine type with its runtime state.
//! - [`timer::EmitTimer`] -- Drift-compensated countdown for periodic emitters.
//! - [`shell::ShellExecutor`] -- The non-blocking contract a shell backend
//!   implements; [`marker`] isolates each command run on a shared session.
//! - [`event::EventBus`] -- Ring-buffered typed events with passive listeners.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic motion.
//! - [`serialize`] -- Versioned state and layout blobs via bitcode.

pub mod bridge;
pub mod direction;
mod dispatch;
pub mod engine;
pub mod event;
pub mod fixed;
pub mod grid;
pub mod id;
#[cfg(feature = "data-loader")]
pub mod layout;
pub mod machine;
pub mod marker;
mod motion;
pub mod orphan;
pub mod packet;
pub mod ring;
pub mod serialize;
pub mod shell;
pub mod sim;
pub mod timer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
