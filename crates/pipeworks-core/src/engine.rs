//! The simulation context: owns the grid, the machine arena, packets,
//! orphans and the shell bridge, and runs the per-frame update.
//!
//! # Frame Pipeline
//!
//! Each [`Simulation::update`] runs, in order:
//! 1. **Emit** -- every machine tries to place output on its neighbors.
//! 2. **Delay flush** -- delay entries that aged out move to their queues.
//! 3. **Shell** -- command machines write input and poll their sessions.
//! 4. **Motion** -- packets advance, cross cells and enter machines.
//! 5. **Orphans** -- cosmetic projectile step for fallen packets.
//!
//! Buffered events are delivered to passive listeners after step 5, then the
//! tick counter advances.

use slotmap::SlotMap;

use crate::bridge::{BridgeFrame, CommandBridge};
use crate::direction::Direction;
use crate::dispatch::{self, Frame};
use crate::event::{EventBus, EventKind, PassiveListener};
use crate::fixed::{Ticks, fixed64_to_f32};
use crate::grid::{Cell, Grid, GridError};
use crate::id::{MachineId, PacketId};
use crate::machine::{Machine, MachineKind};
use crate::motion;
use crate::orphan::{OrphanedPacket, Viewport, step_orphans};
use crate::packet::{CELL_SIZE, Packet};
use crate::shell::ShellExecutor;
use crate::sim::{SimConfig, SimState};

/// What happened during one [`Simulation::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Packets placed by machines in the emit step.
    pub emitted: usize,
    /// Packets delivered into machines.
    pub consumed: usize,
    /// Packets that left the belts as orphans.
    pub orphaned: usize,
    /// Orphans removed after reaching their maximum age.
    pub expired: usize,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// A single-threaded, frame-driven factory simulation.
pub struct Simulation {
    pub(crate) grid: Grid,
    pub(crate) machines: SlotMap<MachineId, Machine>,
    /// Live machines in placement order. Machines emit in this order.
    pub(crate) order: Vec<MachineId>,
    /// Belt packets, in processing order.
    pub(crate) packets: Vec<Packet>,
    pub(crate) orphans: Vec<OrphanedPacket>,
    pub(crate) config: SimConfig,
    pub sim_state: SimState,
    pub(crate) running: bool,
    pub(crate) next_packet_id: u64,
    pub(crate) viewport: Viewport,
    pub(crate) bridge: CommandBridge,
    /// Typed event bus for simulation events.
    pub event_bus: EventBus,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("width", &self.grid.width())
            .field("height", &self.grid.height())
            .field("machines", &self.machines.len())
            .field("packets", &self.packets.len())
            .field("orphans", &self.orphans.len())
            .field("sim_state", &self.sim_state)
            .field("running", &self.running)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

fn default_viewport(grid: &Grid) -> Viewport {
    Viewport::new(
        0.0,
        0.0,
        (grid.width() as i64 * CELL_SIZE as i64) as f32,
        (grid.height() as i64 * CELL_SIZE as i64) as f32,
    )
}

impl Simulation {
    /// An empty, stopped simulation with default tunables.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_config(width, height, SimConfig::default())
    }

    pub fn with_config(width: u32, height: u32, config: SimConfig) -> Self {
        let grid = Grid::new(width, height);
        Self {
            viewport: default_viewport(&grid),
            grid,
            machines: SlotMap::with_key(),
            order: Vec::new(),
            packets: Vec::new(),
            orphans: Vec::new(),
            event_bus: EventBus::new(config.event_capacity),
            config,
            sim_state: SimState::new(),
            running: false,
            next_packet_id: 1,
            bridge: CommandBridge::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Grid editing
    // -----------------------------------------------------------------------

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Lay a belt, replacing whatever occupied the cell.
    pub fn set_belt(&mut self, x: i32, y: i32, direction: Direction) -> Result<(), GridError> {
        self.clear_cell(x, y)?;
        self.grid.set_cell(x, y, Cell::Belt { direction })
    }

    /// Place a machine with its origin at `(x, y)`. Anything in the cells it
    /// covers is removed first; a machine partly overlapped is removed whole.
    pub fn place_machine(
        &mut self,
        x: i32,
        y: i32,
        direction: Direction,
        kind: MachineKind,
    ) -> Result<MachineId, GridError> {
        let machine = Machine::new(x, y, direction, kind);
        let cells = machine.cells();
        if let Some(&(cx, cy)) = cells.iter().find(|&&(cx, cy)| !self.grid.in_bounds(cx, cy)) {
            return Err(GridError::OutOfBounds {
                x: cx,
                y: cy,
                width: self.grid.width(),
                height: self.grid.height(),
            });
        }
        for &(cx, cy) in &cells {
            self.clear_cell(cx, cy)?;
        }
        let name = machine.kind.name();
        let id = self.machines.insert(machine);
        self.order.push(id);
        for &(cx, cy) in &cells {
            self.grid.set_cell(cx, cy, Cell::Machine { id })?;
        }
        log::debug!("placed {name} {id:?} at ({x}, {y}) facing {direction:?}");
        Ok(id)
    }

    /// Empty a cell. A machine there is removed from every cell it covers.
    pub fn clear_cell(&mut self, x: i32, y: i32) -> Result<(), GridError> {
        if let Some(id) = self.grid.machine_at(x, y) {
            self.remove_machine(id);
            return Ok(());
        }
        self.grid.set_cell(x, y, Cell::Empty)
    }

    /// Remove a machine and its grid cells, stopping its shell session.
    pub fn remove_machine(&mut self, id: MachineId) -> Option<Machine> {
        let machine = self.machines.remove(id)?;
        self.order.retain(|&other| other != id);
        self.grid.clear_machine(id);
        self.bridge.forget(id);
        Some(machine)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn machine_mut(&mut self, id: MachineId) -> Option<&mut Machine> {
        self.machines.get_mut(id)
    }

    /// Every machine, in placement order.
    pub fn machines(&self) -> impl Iterator<Item = (MachineId, &Machine)> {
        self.order
            .iter()
            .filter_map(|&id| self.machines.get(id).map(|m| (id, m)))
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    pub fn machine_at(&self, x: i32, y: i32) -> Option<MachineId> {
        self.grid.machine_at(x, y)
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn orphans(&self) -> &[OrphanedPacket] {
        &self.orphans
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Tunables may change between frames; they take effect on the next
    /// update.
    pub fn config_mut(&mut self) -> &mut SimConfig {
        &mut self.config
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// True iff no packet currently occupies the cell.
    pub fn is_cell_empty(&self, x: i32, y: i32) -> bool {
        crate::packet::is_cell_empty(&self.packets, x, y)
    }

    /// True iff some packet sits in the front part of the cell.
    pub fn is_front_occupied(&self, x: i32, y: i32) -> bool {
        crate::packet::is_front_occupied(&self.packets, x, y, None)
    }

    pub fn tick(&self) -> Ticks {
        self.sim_state.tick
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // -----------------------------------------------------------------------
    // Host input
    // -----------------------------------------------------------------------

    /// Install the executor command machines open their sessions with.
    pub fn set_shell_executor(&mut self, executor: Box<dyn ShellExecutor>) {
        self.bridge.set_executor(executor);
    }

    pub fn bridge(&self) -> &CommandBridge {
        &self.bridge
    }

    /// Bounds orphans bounce inside. Defaults to the grid's pixel area.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Queue a typed character on a keyboard machine.
    pub fn send_key(&mut self, id: MachineId, key: char) -> bool {
        match self.machines.get_mut(id).map(|m| &mut m.kind) {
            Some(MachineKind::Keyboard { queue }) => {
                queue.push_back(key.to_string());
                true
            }
            _ => false,
        }
    }

    /// Queue one press on a button machine.
    pub fn press_button(&mut self, id: MachineId) -> bool {
        match self.machines.get_mut(id).map(|m| &mut m.kind) {
            Some(MachineKind::Button { presses, .. }) => {
                *presses += 1;
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Event system
    // -----------------------------------------------------------------------

    /// Suppress an event kind. Suppressed events are never buffered.
    pub fn suppress_event(&mut self, kind: EventKind) {
        self.event_bus.suppress(kind);
    }

    /// Register a passive listener for an event kind.
    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.event_bus.on_passive(kind, listener);
    }

    /// Take every buffered event, oldest first.
    pub fn drain_events(&mut self) -> Vec<crate::event::Event> {
        self.event_bus.drain()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Reset every machine to its start-of-simulation state and begin
    /// running. Restarting a running simulation stops it first.
    pub fn start(&mut self) {
        if self.running {
            self.stop();
        }
        self.reset_runtime();
        self.running = true;
        log::debug!("simulation started with {} machines", self.machines.len());
    }

    /// Stop running. Shell sessions are closed and results still in flight
    /// are discarded.
    pub fn stop(&mut self) {
        self.bridge.cancel_all();
        self.reset_runtime();
        self.running = false;
        log::debug!("simulation stopped at tick {}", self.sim_state.tick);
    }

    fn reset_runtime(&mut self) {
        for machine in self.machines.values_mut() {
            machine.reset();
        }
        self.packets.clear();
        self.orphans.clear();
        self.sim_state = SimState::new();
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Advance the simulation by one wall-clock frame of `frame_ms`. A
    /// stopped simulation does nothing.
    pub fn update(&mut self, frame_ms: f64) -> FrameStats {
        let mut stats = FrameStats::default();
        if !self.running {
            return stats;
        }

        let dt = self.config.scaled_dt(frame_ms);
        self.sim_state.time += dt;
        let tick = self.sim_state.tick;
        let now = self.sim_state.time;
        let fresh_from = PacketId(self.next_packet_id);

        // Step 1: emit.
        {
            let mut frame = Frame {
                grid: &self.grid,
                packets: &mut self.packets,
                orphans: &mut self.orphans,
                events: &mut self.event_bus,
                next_packet_id: &mut self.next_packet_id,
                config: &self.config,
                tick,
                now,
                dt,
            };
            for &id in &self.order {
                if let Some(machine) = self.machines.get_mut(id) {
                    dispatch::emit(&mut frame, id, machine);
                }
            }
        }
        stats.emitted = (self.next_packet_id - fresh_from.0) as usize;

        // Step 2: delay flush.
        dispatch::flush_delays(&mut self.machines, now);

        // Step 3: shell bridge.
        {
            let mut frame = BridgeFrame {
                events: &mut self.event_bus,
                config: &self.config,
                tick,
                now,
            };
            self.bridge.drive(&mut self.machines, &mut frame);
        }

        // Step 4: packet motion.
        {
            let mut frame = Frame {
                grid: &self.grid,
                packets: &mut self.packets,
                orphans: &mut self.orphans,
                events: &mut self.event_bus,
                next_packet_id: &mut self.next_packet_id,
                config: &self.config,
                tick,
                now,
                dt,
            };
            let motion = motion::advance_packets(&mut frame, &mut self.machines, fresh_from);
            stats.consumed = motion.consumed;
            stats.orphaned = motion.orphaned;
        }

        // Step 5: orphans.
        stats.expired = step_orphans(
            &mut self.orphans,
            fixed64_to_f32(dt),
            &self.viewport,
            &self.config.orphan,
        );

        self.event_bus.deliver();
        self.sim_state.tick += 1;
        stats
    }

    /// Run `frames` updates of `frame_ms` each, summing the stats.
    pub fn run_frames(&mut self, frames: usize, frame_ms: f64) -> FrameStats {
        let mut total = FrameStats::default();
        for _ in 0..frames {
            let stats = self.update(frame_ms);
            total.emitted += stats.emitted;
            total.consumed += stats.consumed;
            total.orphaned += stats.orphaned;
            total.expired += stats.expired;
        }
        total
    }
}

/// Placement order for restored machines: `saved` entries that are still
/// live, then any live machine it missed, in slot order.
pub(crate) fn restore_order(
    saved: Vec<MachineId>,
    machines: &SlotMap<MachineId, Machine>,
) -> Vec<MachineId> {
    let mut order: Vec<MachineId> = Vec::with_capacity(machines.len());
    for id in saved {
        if machines.contains_key(id) && !order.contains(&id) {
            order.push(id);
        }
    }
    for id in machines.keys() {
        if !order.contains(&id) {
            order.push(id);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::machine::{CommandMachine, CommandMode, CommandStatus};
    use crate::test_utils::ScriptedShell;

    #[test]
    fn place_machine_rejects_out_of_bounds() {
        let mut sim = Simulation::new(2, 2);
        let err = sim
            .place_machine(2, 0, Direction::Right, MachineKind::sink())
            .unwrap_err();
        assert!(matches!(err, GridError::OutOfBounds { x: 2, y: 0, .. }));
        assert_eq!(sim.machine_count(), 0);
    }

    #[test]
    fn splitter_covers_two_cells() {
        let mut sim = Simulation::new(3, 3);
        let id = sim
            .place_machine(1, 0, Direction::Right, MachineKind::splitter())
            .unwrap();
        assert_eq!(sim.machine_at(1, 0), Some(id));
        assert_eq!(sim.machine_at(1, 1), Some(id));
    }

    #[test]
    fn splitter_second_cell_must_fit() {
        let mut sim = Simulation::new(3, 1);
        assert!(
            sim.place_machine(0, 0, Direction::Right, MachineKind::splitter())
                .is_err()
        );
    }

    #[test]
    fn placing_over_a_splitter_removes_it_whole() {
        let mut sim = Simulation::new(3, 3);
        let splitter = sim
            .place_machine(1, 0, Direction::Right, MachineKind::splitter())
            .unwrap();
        sim.place_machine(1, 1, Direction::Right, MachineKind::Null)
            .unwrap();
        assert!(sim.machine(splitter).is_none());
        assert_eq!(sim.grid().cell(1, 0), Cell::Empty);
        assert_eq!(sim.machine_count(), 1);
    }

    #[test]
    fn belt_replaces_machine() {
        let mut sim = Simulation::new(2, 1);
        let id = sim
            .place_machine(0, 0, Direction::Right, MachineKind::sink())
            .unwrap();
        sim.set_belt(0, 0, Direction::Down).unwrap();
        assert!(sim.machine(id).is_none());
        assert_eq!(
            sim.grid().cell(0, 0),
            Cell::Belt {
                direction: Direction::Down
            }
        );
    }

    #[test]
    fn machines_emit_in_placement_order_after_slot_reuse() {
        let mut sim = Simulation::new(2, 2);
        let first = sim
            .place_machine(0, 0, Direction::Right, MachineKind::clock('a', 100.0))
            .unwrap();
        let second = sim
            .place_machine(0, 1, Direction::Right, MachineKind::clock('b', 100.0))
            .unwrap();
        sim.remove_machine(first);
        // Takes over the freed slot, ahead of `second` in slot order.
        let third = sim
            .place_machine(0, 0, Direction::Right, MachineKind::clock('c', 100.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        sim.set_belt(1, 1, Direction::Right).unwrap();

        let ids: Vec<MachineId> = sim.machines().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![second, third]);

        sim.start();
        sim.update(16.0);
        let emitters: Vec<MachineId> = sim
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::PacketEmitted { machine, .. } => Some(machine),
                _ => None,
            })
            .collect();
        assert_eq!(emitters, vec![second, third]);
    }

    #[test]
    fn restored_order_keeps_live_ids_and_appends_missing() {
        let mut machines: SlotMap<MachineId, Machine> = SlotMap::with_key();
        let a = machines.insert(Machine::new(0, 0, Direction::Right, MachineKind::Null));
        let b = machines.insert(Machine::new(1, 0, Direction::Right, MachineKind::Null));
        let gone = machines.insert(Machine::new(2, 0, Direction::Right, MachineKind::Null));
        machines.remove(gone);
        assert_eq!(restore_order(vec![b, gone, b], &machines), vec![b, a]);
    }

    #[test]
    fn stopped_simulation_does_not_advance() {
        let mut sim = Simulation::new(2, 1);
        sim.place_machine(0, 0, Direction::Right, MachineKind::source("A", 10.0, true, 0.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        assert_eq!(sim.update(16.0), FrameStats::default());
        assert_eq!(sim.tick(), 0);
        assert!(sim.packets().is_empty());
    }

    #[test]
    fn fresh_packets_wait_one_frame_before_moving() {
        let mut sim = Simulation::new(3, 1);
        sim.place_machine(0, 0, Direction::Right, MachineKind::source("A", 500.0, false, 0.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        sim.start();

        let stats = sim.update(16.0);
        assert_eq!(stats.emitted, 1);
        assert_eq!(sim.packets()[0].along(), crate::fixed::Fixed64::ZERO);

        sim.update(16.0);
        assert!(sim.packets()[0].along() > crate::fixed::Fixed64::ZERO);
    }

    #[test]
    fn keyboard_and_button_input() {
        let mut sim = Simulation::new(3, 1);
        let keyboard = sim
            .place_machine(0, 0, Direction::Right, MachineKind::keyboard())
            .unwrap();
        let sink = sim
            .place_machine(1, 0, Direction::Right, MachineKind::sink())
            .unwrap();
        sim.start();

        assert!(sim.send_key(keyboard, 'k'));
        assert!(!sim.send_key(sink, 'k'));
        assert!(!sim.press_button(keyboard));

        sim.run_frames(60, 16.0);
        assert_eq!(sim.machine(sink).unwrap().sink_contents().unwrap(), vec!["k"]);
    }

    #[test]
    fn start_resets_runtime_state() {
        let mut sim = Simulation::new(3, 1);
        sim.place_machine(0, 0, Direction::Right, MachineKind::source("AB", 10.0, true, 0.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        sim.start();
        sim.run_frames(30, 16.0);
        assert!(sim.tick() > 0);
        assert!(!sim.packets().is_empty() || !sim.orphans().is_empty());

        sim.start();
        assert_eq!(sim.tick(), 0);
        assert!(sim.packets().is_empty());
        assert!(sim.orphans().is_empty());
    }

    #[test]
    fn stop_cancels_shell_sessions() {
        let shell = ScriptedShell::new();
        let mut sim = Simulation::new(3, 1);
        sim.set_shell_executor(Box::new(shell.clone()));
        let keyboard = sim
            .place_machine(0, 0, Direction::Right, MachineKind::keyboard())
            .unwrap();
        let command = sim
            .place_machine(
                1,
                0,
                Direction::Right,
                MachineKind::command(CommandMachine::new("cat", CommandMode::Stream)),
            )
            .unwrap();
        sim.start();
        sim.send_key(keyboard, 'x');
        sim.run_frames(40, 16.0);
        assert_eq!(sim.bridge().active_links(), 1);

        sim.stop();
        assert_eq!(sim.bridge().active_links(), 0);
        assert_eq!(shell.stopped(), 1);
        let cmd = sim.machine(command).unwrap().as_command().unwrap();
        assert_eq!(cmd.status, CommandStatus::Idle);
        assert!(cmd.output.is_empty());
    }

    #[test]
    fn listeners_see_events_after_each_frame() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut sim = Simulation::new(2, 1);
        sim.place_machine(0, 0, Direction::Right, MachineKind::source("A", 500.0, false, 0.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        sim.on_passive(
            EventKind::PacketEmitted,
            Box::new(move |event| sink.borrow_mut().push(event.clone())),
        );
        sim.start();
        sim.update(16.0);
        assert!(matches!(
            seen.borrow()[..],
            [Event::PacketEmitted { tick: 0, .. }]
        ));
    }

    #[test]
    fn suppressed_kinds_are_not_buffered() {
        let mut sim = Simulation::new(2, 1);
        sim.place_machine(0, 0, Direction::Right, MachineKind::source("A", 500.0, false, 0.0))
            .unwrap();
        sim.set_belt(1, 0, Direction::Right).unwrap();
        sim.suppress_event(EventKind::PacketEmitted);
        sim.start();
        sim.update(16.0);
        assert!(sim.drain_events().is_empty());
    }
}
