//! Per-kind machine behavior: `emit` (produce) and `deliver` (consume).
//!
//! Both run against a [`Frame`], which borrows the parts of the simulation a
//! machine may touch while the machine itself is borrowed out of the arena.

use std::f32::consts::TAU;

use slotmap::SlotMap;

use crate::direction::Direction;
use crate::event::{Event, EventBus};
use crate::fixed::{Millis, Ticks, f64_to_fixed64};
use crate::grid::{Cell, Grid};
use crate::id::{MachineId, PacketId};
use crate::machine::{
    FilterMode, Machine, MachineKind, Queue, SCREEN_CELLS, byte_of, char_of, is_exactly,
};
use crate::orphan::OrphanedPacket;
use crate::packet::{CELL_SIZE, Packet, is_cell_empty};
use crate::sim::SimConfig;

// ---------------------------------------------------------------------------
// Frame context
// ---------------------------------------------------------------------------

/// Mutable view of the simulation during one frame, minus the machine arena.
pub(crate) struct Frame<'a> {
    pub grid: &'a Grid,
    pub packets: &'a mut Vec<Packet>,
    pub orphans: &'a mut Vec<OrphanedPacket>,
    pub events: &'a mut EventBus,
    pub next_packet_id: &'a mut u64,
    pub config: &'a SimConfig,
    pub tick: Ticks,
    pub now: Millis,
    pub dt: Millis,
}

impl Frame<'_> {
    pub fn alloc_packet_id(&mut self) -> PacketId {
        let id = PacketId(*self.next_packet_id);
        *self.next_packet_id += 1;
        id
    }

    /// Whether a machine at `from` could place a packet toward `dir` now.
    ///
    /// The neighbor must be a belt pointing `dir` with no packet on it, or
    /// another machine, in which case the emitting cell itself must be free.
    fn can_output(&self, machine: MachineId, from: (i32, i32), dir: Direction) -> bool {
        let (nx, ny) = Grid::neighbor(from.0, from.1, dir);
        match self.grid.cell(nx, ny) {
            Cell::Belt { direction } if direction == dir => is_cell_empty(&self.packets, nx, ny),
            Cell::Machine { id } if id != machine => is_cell_empty(&self.packets, from.0, from.1),
            _ => false,
        }
    }

    /// Place `content` leaving `from` toward `dir`. Returns false when the
    /// output is unavailable; nothing is placed in that case.
    fn output(&mut self, machine: MachineId, from: (i32, i32), dir: Direction, content: &str) -> bool {
        if !self.can_output(machine, from, dir) {
            return false;
        }
        let id = self.alloc_packet_id();
        let (nx, ny) = Grid::neighbor(from.0, from.1, dir);
        let packet = match self.grid.cell(nx, ny) {
            Cell::Belt { .. } => Packet::entering(id, nx, ny, dir, content.to_string()),
            _ => Packet::leaving(id, from.0, from.1, dir, content.to_string()),
        };
        self.packets.push(packet);
        self.events.emit(Event::PacketEmitted {
            machine,
            packet: id,
            tick: self.tick,
        });
        true
    }

    /// Output the front of `queue`, popping it on success.
    fn output_front(
        &mut self,
        machine: MachineId,
        from: (i32, i32),
        dir: Direction,
        queue: &mut Queue,
    ) -> bool {
        let Some(content) = queue.front() else {
            return false;
        };
        if self.output(machine, from, dir, content) {
            queue.pop_front();
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Emit
// ---------------------------------------------------------------------------

/// Try to emit one packet (or one set of copies) from `machine`.
pub(crate) fn emit(frame: &mut Frame<'_>, id: MachineId, machine: &mut Machine) -> bool {
    let Machine {
        x,
        y,
        direction,
        last_command_time,
        kind,
    } = machine;
    let at = (*x, *y);
    let forward = *direction;

    let emitted = match kind {
        MachineKind::Source(seq) | MachineKind::Byte(seq) | MachineKind::PunchCard(seq) => {
            let due = seq.due(frame.dt).map(str::to_owned);
            match due {
                Some(content) if frame.output(id, at, forward, &content) => {
                    seq.commit();
                    true
                }
                _ => false,
            }
        }
        MachineKind::Linefeed(timed) | MachineKind::Clock(timed) => {
            timed.timer.advance(frame.dt);
            let content = timed.content.to_string();
            if timed.timer.should_tick() && frame.output(id, at, forward, &content) {
                timed.timer.restart();
                true
            } else {
                false
            }
        }
        MachineKind::Display {
            buffer,
            shown,
            shown_at,
            last_input_at,
        } => {
            let timeout = f64_to_fixed64(frame.config.display_timeout_ms);
            let idle = last_input_at.is_some_and(|t| frame.now - t >= timeout);
            if !buffer.is_empty() && idle {
                *shown = std::mem::take(buffer);
                *shown_at = Some(frame.now);
                frame.events.emit(Event::DisplayFlushed {
                    machine: id,
                    text: shown.clone(),
                    tick: frame.tick,
                });
            }
            false
        }
        MachineKind::Command(command) => {
            let next = command.output.front().copied();
            match next {
                Some(c) if frame.output(id, at, forward, &c.to_string()) => {
                    command.output.pop_front();
                    true
                }
                _ => false,
            }
        }
        MachineKind::Flipper { output, queue } => frame.output_front(id, at, *output, queue),
        MachineKind::Duplicator { queue } => emit_copies(frame, id, at, forward, queue),
        MachineKind::Button { content, presses } => {
            if *presses > 0 && frame.output(id, at, forward, &content.to_string()) {
                *presses -= 1;
                true
            } else {
                false
            }
        }
        MachineKind::Router {
            match_direction,
            else_direction,
            match_queue,
            else_queue,
            ..
        } => {
            let matched = frame.output_front(id, at, *match_direction, match_queue);
            let other = frame.output_front(id, at, *else_direction, else_queue);
            matched || other
        }
        MachineKind::Splitter {
            queue,
            favor_second,
        } => {
            let (dx, dy) = forward.rotate_cw().delta();
            let sides = [at, (at.0 + dx, at.1 + dy)];
            let order = if *favor_second { [1, 0] } else { [0, 1] };
            let sent = order
                .into_iter()
                .any(|side| frame.output_front(id, sides[side], forward, queue));
            if sent {
                *favor_second = !*favor_second;
            }
            sent
        }
        MachineKind::Filter { queue, .. }
        | MachineKind::Counter { queue, .. }
        | MachineKind::Delay { queue, .. }
        | MachineKind::Keyboard { queue }
        | MachineKind::Packer { queue, .. }
        | MachineKind::Unpacker { queue }
        | MachineKind::Gate { queue, .. }
        | MachineKind::Latch { queue, .. }
        | MachineKind::Wireless { queue, .. }
        | MachineKind::Replace { queue, .. }
        | MachineKind::Math { queue, .. }
        | MachineKind::SevenSeg { queue, .. }
        | MachineKind::Drum { queue, .. } => frame.output_front(id, at, forward, queue),
        MachineKind::Sink { .. }
        | MachineKind::Speak { .. }
        | MachineKind::Null
        | MachineKind::Tone { .. }
        | MachineKind::Screen { .. }
        | MachineKind::Tnt { .. } => false,
    };

    if emitted {
        *last_command_time = Some(frame.now);
    }
    emitted
}

/// Duplicator: one copy to every connected output, all or nothing.
fn emit_copies(
    frame: &mut Frame<'_>,
    id: MachineId,
    at: (i32, i32),
    forward: Direction,
    queue: &mut Queue,
) -> bool {
    let Some(content) = queue.front().cloned() else {
        return false;
    };
    let outputs: Vec<Direction> = [forward, forward.rotate_cw(), forward.rotate_ccw()]
        .into_iter()
        .filter(|&dir| frame.grid.outgoing_belt(at.0, at.1, dir))
        .collect();
    if outputs.is_empty() || !outputs.iter().all(|&dir| frame.can_output(id, at, dir)) {
        return false;
    }
    for dir in outputs {
        frame.output(id, at, dir, &content);
    }
    queue.pop_front();
    true
}

// ---------------------------------------------------------------------------
// Delay flush
// ---------------------------------------------------------------------------

/// Move delay entries whose age reached the machine's delay into its output
/// queue, oldest first.
pub(crate) fn flush_delays(machines: &mut SlotMap<MachineId, Machine>, now: Millis) {
    for machine in machines.values_mut() {
        if let MachineKind::Delay {
            delay_ms,
            pending,
            queue,
        } = &mut machine.kind
        {
            while pending.front().is_some_and(|(_, at)| now - *at >= *delay_ms) {
                if let Some((content, _)) = pending.pop_front() {
                    queue.push_back(content);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deliver
// ---------------------------------------------------------------------------

/// Hand `content` to machine `id`, arriving from side `from`. Returns false
/// when the machine refuses it; the caller orphans the packet then.
pub(crate) fn deliver(
    frame: &mut Frame<'_>,
    machines: &mut SlotMap<MachineId, Machine>,
    id: MachineId,
    content: &str,
    from: Direction,
) -> bool {
    let channel = match machines.get(id).map(|m| &m.kind) {
        None => return false,
        Some(MachineKind::Wireless { channel, .. }) => Some(*channel),
        Some(_) => None,
    };
    if let Some(channel) = channel {
        broadcast(frame, machines, id, channel, content);
        return true;
    }

    let Some(machine) = machines.get_mut(id) else {
        return false;
    };
    let accepted = deliver_to(frame, id, machine, content, from);
    if accepted {
        machine.last_command_time = Some(frame.now);
    }
    accepted
}

/// Wireless: every other transmitter on the channel receives a copy.
fn broadcast(
    frame: &mut Frame<'_>,
    machines: &mut SlotMap<MachineId, Machine>,
    sender: MachineId,
    channel: crate::id::ChannelId,
    content: &str,
) {
    for (other, machine) in machines.iter_mut() {
        if let MachineKind::Wireless {
            channel: heard,
            queue,
            pulses,
        } = &mut machine.kind
        {
            if other == sender {
                *pulses += 1;
                machine.last_command_time = Some(frame.now);
            } else if *heard == channel {
                queue.push_back(content.to_string());
                *pulses += 1;
                machine.last_command_time = Some(frame.now);
            }
        }
    }
    frame.events.emit(Event::WirelessTransmit {
        machine: sender,
        channel,
        content: content.to_string(),
        tick: frame.tick,
    });
}

fn deliver_to(
    frame: &mut Frame<'_>,
    id: MachineId,
    machine: &mut Machine,
    content: &str,
    from: Direction,
) -> bool {
    let at = (machine.x, machine.y);
    let tick = frame.tick;
    let now = frame.now;

    match &mut machine.kind {
        // Generators swallow anything fed to them.
        MachineKind::Source(_)
        | MachineKind::Byte(_)
        | MachineKind::PunchCard(_)
        | MachineKind::Linefeed(_)
        | MachineKind::Clock(_)
        | MachineKind::Keyboard { .. }
        | MachineKind::Button { .. }
        | MachineKind::Null => true,
        // Fan-out happens in `broadcast`.
        MachineKind::Wireless { .. } => true,
        MachineKind::Sink { ring, received } => {
            ring.push(content.to_string());
            *received += 1;
            frame.events.emit(Event::SinkReceived {
                machine: id,
                content: content.to_string(),
                tick,
            });
            true
        }
        MachineKind::Display {
            buffer,
            shown,
            shown_at,
            last_input_at,
        } => {
            for c in content.chars() {
                if c == '\n' {
                    *shown = std::mem::take(buffer);
                    *shown_at = Some(now);
                    frame.events.emit(Event::DisplayFlushed {
                        machine: id,
                        text: shown.clone(),
                        tick,
                    });
                } else {
                    buffer.push(c);
                }
            }
            *last_input_at = Some(now);
            true
        }
        MachineKind::Speak {
            delimiter,
            buffer,
            spoken,
            spoken_at,
        } => {
            for c in content.chars() {
                if c != *delimiter {
                    buffer.push(c);
                } else if !buffer.is_empty() {
                    *spoken = std::mem::take(buffer);
                    *spoken_at = Some(now);
                    frame.events.emit(Event::Speak {
                        machine: id,
                        text: spoken.clone(),
                        tick,
                    });
                }
            }
            true
        }
        MachineKind::Command(command) => {
            if !command.processing {
                command.pending_input.push_str(content);
            }
            true
        }
        MachineKind::Flipper { output, queue } => {
            for step in 1..=4 {
                let dir = output.rotated(step);
                if frame.grid.outgoing_belt(at.0, at.1, dir) {
                    *output = dir;
                    break;
                }
            }
            queue.push_back(content.to_string());
            true
        }
        MachineKind::Duplicator { queue } | MachineKind::Splitter { queue, .. } => {
            queue.push_back(content.to_string());
            true
        }
        MachineKind::Unpacker { queue } => {
            queue.extend(content.chars().map(String::from));
            true
        }
        MachineKind::Filter { byte, mode, queue } => {
            let matched = is_exactly(content, *byte);
            let keep = match mode {
                FilterMode::Pass => matched,
                FilterMode::Block => !matched,
            };
            if keep {
                queue.push_back(content.to_string());
            }
            true
        }
        MachineKind::Counter {
            trigger,
            count,
            queue,
        } => {
            if is_exactly(content, *trigger) {
                queue.extend(count.to_string().chars().map(String::from));
                *count = 0;
            } else {
                *count += 1;
            }
            true
        }
        MachineKind::Delay { pending, .. } => {
            pending.push_back((content.to_string(), now));
            true
        }
        MachineKind::Packer {
            delimiter,
            include_delimiter,
            buffer,
            queue,
        } => {
            for c in content.chars() {
                if c != *delimiter {
                    buffer.push(c);
                    continue;
                }
                if buffer.is_empty() {
                    continue;
                }
                let mut payload = std::mem::take(buffer);
                if *include_delimiter {
                    payload.push(c);
                }
                frame.events.emit(Event::Packed {
                    machine: id,
                    len: payload.chars().count(),
                    tick,
                });
                queue.push_back(payload);
            }
            true
        }
        MachineKind::Router {
            match_byte,
            match_queue,
            else_queue,
            ..
        } => {
            if is_exactly(content, *match_byte) {
                match_queue.push_back(content.to_string());
            } else {
                else_queue.push_back(content.to_string());
            }
            true
        }
        MachineKind::Gate {
            data_direction,
            control_direction,
            open,
            queue,
        } => {
            if from == *control_direction {
                *open = true;
            } else if from == *data_direction && *open {
                queue.push_back(content.to_string());
                *open = false;
            }
            true
        }
        MachineKind::Latch {
            data_direction,
            control_direction,
            stored,
            queue,
        } => {
            if from == *data_direction {
                *stored = Some(content.to_string());
            } else if from == *control_direction {
                if let Some(value) = stored {
                    queue.push_back(value.clone());
                }
            }
            true
        }
        MachineKind::Replace {
            from: needle,
            to,
            queue,
        } => {
            let replaced = content
                .chars()
                .map(|c| if c == *needle { *to } else { c })
                .collect();
            queue.push_back(replaced);
            true
        }
        MachineKind::Math { op, operand, queue } => {
            let result = content
                .chars()
                .map(|c| char_of(op.apply(byte_of(c), *operand)))
                .collect();
            queue.push_back(result);
            true
        }
        MachineKind::SevenSeg { value, queue } => {
            *value = content.chars().next();
            if let Some(shown) = *value {
                frame.events.emit(Event::SevenSegShown {
                    machine: id,
                    value: shown,
                    tick,
                });
            }
            queue.push_back(content.to_string());
            true
        }
        MachineKind::Drum {
            mode,
            last_samples,
            queue,
        } => {
            if let Some(c) = content.chars().next() {
                *last_samples = mode.samples(byte_of(c));
                frame.events.emit(Event::DrumHit {
                    machine: id,
                    samples: *last_samples,
                    tick,
                });
            }
            queue.push_back(content.to_string());
            true
        }
        MachineKind::Tone { voice, value } => {
            *value = content.chars().next().map_or(0, byte_of);
            frame.events.emit(Event::ToneChanged {
                machine: id,
                voice: *voice,
                value: *value,
                tick,
            });
            true
        }
        MachineKind::Screen { cells, cursor } => {
            for c in content.chars() {
                let index = *cursor % SCREEN_CELLS;
                let value = byte_of(c);
                if let Some(cell) = cells.get_mut(index) {
                    *cell = value;
                }
                *cursor = (index + 1) % SCREEN_CELLS;
                frame.events.emit(Event::ScreenWritten {
                    machine: id,
                    index,
                    value,
                    tick,
                });
            }
            true
        }
        MachineKind::Tnt { stored, exploded } => {
            if *exploded {
                return false;
            }
            stored.push(content.to_string());
            if stored.len() >= frame.config.tnt_threshold.max(1) {
                let fragments = std::mem::take(stored);
                *exploded = true;
                explode(frame, id, at, fragments);
            }
            true
        }
    }
}

/// Launch every stored payload radially from the machine's center.
fn explode(frame: &mut Frame<'_>, id: MachineId, at: (i32, i32), fragments: Vec<String>) {
    let count = fragments.len();
    let center = (
        (at.0 * CELL_SIZE + CELL_SIZE / 2) as f32,
        (at.1 * CELL_SIZE + CELL_SIZE / 2) as f32,
    );
    let speed = frame.config.belt_velocity() * 4.0;
    for (i, content) in fragments.into_iter().enumerate() {
        let angle = TAU * i as f32 / count as f32;
        let packet = frame.alloc_packet_id();
        frame.orphans.push(OrphanedPacket::new(
            packet,
            center,
            (angle.cos() * speed, angle.sin() * speed),
            content,
        ));
    }
    frame.events.emit(Event::Exploded {
        machine: id,
        fragments: count,
        tick: frame.tick,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::fixed::ms;
    use crate::id::ChannelId;
    use crate::machine::{DrumMode, MathOp};

    struct Rig {
        grid: Grid,
        packets: Vec<Packet>,
        orphans: Vec<OrphanedPacket>,
        events: EventBus,
        next_packet_id: u64,
        config: SimConfig,
        machines: SlotMap<MachineId, Machine>,
    }

    impl Rig {
        fn new(width: u32, height: u32) -> Self {
            Self {
                grid: Grid::new(width, height),
                packets: Vec::new(),
                orphans: Vec::new(),
                events: EventBus::new(256),
                next_packet_id: 0,
                config: SimConfig::default(),
                machines: SlotMap::with_key(),
            }
        }

        fn belt(&mut self, x: i32, y: i32, direction: Direction) {
            self.grid.set_cell(x, y, Cell::Belt { direction }).unwrap();
        }

        fn place(&mut self, machine: Machine) -> MachineId {
            let cells = machine.cells();
            let id = self.machines.insert(machine);
            for (x, y) in cells {
                self.grid.set_cell(x, y, Cell::Machine { id }).unwrap();
            }
            id
        }

        fn frame(&mut self) -> (Frame<'_>, &mut SlotMap<MachineId, Machine>) {
            (
                Frame {
                    grid: &self.grid,
                    packets: &mut self.packets,
                    orphans: &mut self.orphans,
                    events: &mut self.events,
                    next_packet_id: &mut self.next_packet_id,
                    config: &self.config,
                    tick: 0,
                    now: ms(0.0),
                    dt: ms(16.0),
                },
                &mut self.machines,
            )
        }

        fn deliver(&mut self, id: MachineId, content: &str, from: Direction) -> bool {
            let (mut frame, machines) = self.frame();
            deliver(&mut frame, machines, id, content, from)
        }

        fn emit(&mut self, id: MachineId) -> bool {
            let (mut frame, machines) = self.frame();
            let machine = machines.get_mut(id).unwrap();
            emit(&mut frame, id, machine)
        }

        fn contents(&self) -> Vec<&str> {
            self.packets.iter().map(|p| p.content.as_str()).collect()
        }
    }

    #[test]
    fn emit_requires_matching_empty_belt() {
        let mut rig = Rig::new(3, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::keyboard()));
        if let MachineKind::Keyboard { queue } = &mut rig.machines[id].kind {
            queue.push_back("a".into());
            queue.push_back("b".into());
        }

        assert!(!rig.emit(id), "no belt yet");
        rig.belt(1, 0, Direction::Left);
        assert!(!rig.emit(id), "belt points back at the machine");
        rig.belt(1, 0, Direction::Right);
        assert!(rig.emit(id));
        assert!(!rig.emit(id), "belt cell occupied");
        assert_eq!(rig.contents(), vec!["a"]);
        assert_eq!(rig.packets[0].x, 1);
        assert!(rig.machines[id].last_command_time.is_some());
    }

    #[test]
    fn machine_to_machine_output_leaves_own_cell() {
        let mut rig = Rig::new(2, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::keyboard()));
        rig.place(Machine::new(1, 0, Direction::Right, MachineKind::sink()));
        if let MachineKind::Keyboard { queue } = &mut rig.machines[id].kind {
            queue.push_back("a".into());
            queue.push_back("b".into());
        }
        assert!(rig.emit(id));
        assert_eq!((rig.packets[0].x, rig.packets[0].y), (0, 0));
        assert!(!rig.packets[0].is_front());
        assert!(!rig.emit(id), "own cell occupied");
    }

    #[test]
    fn gate_is_one_shot() {
        let mut rig = Rig::new(3, 3);
        let id = rig.place(Machine::new(
            1,
            1,
            Direction::Right,
            MachineKind::gate(Direction::Left, Direction::Up),
        ));
        rig.deliver(id, "d", Direction::Left);
        rig.deliver(id, "c", Direction::Up);
        rig.deliver(id, "x", Direction::Left);
        rig.deliver(id, "y", Direction::Left);
        rig.deliver(id, "z", Direction::Down);
        match &rig.machines[id].kind {
            MachineKind::Gate { queue, open, .. } => {
                assert_eq!(queue.iter().collect::<Vec<_>>(), vec!["x"]);
                assert!(!open);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn latch_replays_stored_value() {
        let mut rig = Rig::new(3, 3);
        let id = rig.place(Machine::new(
            1,
            1,
            Direction::Right,
            MachineKind::latch(Direction::Left, Direction::Up),
        ));
        rig.deliver(id, "c", Direction::Up);
        rig.deliver(id, "a", Direction::Left);
        rig.deliver(id, "b", Direction::Left);
        rig.deliver(id, "c", Direction::Up);
        rig.deliver(id, "c", Direction::Up);
        match &rig.machines[id].kind {
            MachineKind::Latch { queue, stored, .. } => {
                assert_eq!(queue.iter().collect::<Vec<_>>(), vec!["b", "b"]);
                assert_eq!(stored.as_deref(), Some("b"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn counter_emits_decimal_digits() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::counter('\n')));
        for _ in 0..12 {
            rig.deliver(id, "x", Direction::Left);
        }
        rig.deliver(id, "\n", Direction::Left);
        match &rig.machines[id].kind {
            MachineKind::Counter { queue, count, .. } => {
                assert_eq!(queue.iter().collect::<Vec<_>>(), vec!["1", "2"]);
                assert_eq!(*count, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn filter_modes() {
        let mut rig = Rig::new(2, 1);
        let pass = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::filter('a', FilterMode::Pass)));
        let block = rig.place(Machine::new(1, 0, Direction::Right, MachineKind::filter('a', FilterMode::Block)));
        for c in ["a", "b", "a"] {
            rig.deliver(pass, c, Direction::Left);
            rig.deliver(block, c, Direction::Left);
        }
        let queue_of = |id| match &rig.machines[id].kind {
            MachineKind::Filter { queue, .. } => queue.iter().cloned().collect::<Vec<_>>(),
            _ => unreachable!(),
        };
        assert_eq!(queue_of(pass), vec!["a", "a"]);
        assert_eq!(queue_of(block), vec!["b"]);
    }

    #[test]
    fn packer_flushes_on_delimiter() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::packer(';', true)));
        rig.deliver(id, ";", Direction::Left);
        for c in ["h", "i", ";"] {
            rig.deliver(id, c, Direction::Left);
        }
        match &rig.machines[id].kind {
            MachineKind::Packer { queue, buffer, .. } => {
                assert_eq!(queue.iter().collect::<Vec<_>>(), vec!["hi;"]);
                assert!(buffer.is_empty());
            }
            _ => unreachable!(),
        }
        let packed: Vec<_> = rig.events.iter().filter(|e| e.kind() == EventKind::Packed).collect();
        assert_eq!(packed.len(), 1);
        assert!(matches!(packed[0], Event::Packed { len: 3, .. }));
    }

    #[test]
    fn unpacker_splits_payload() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::unpacker()));
        rig.deliver(id, "abc", Direction::Left);
        match &rig.machines[id].kind {
            MachineKind::Unpacker { queue } => assert_eq!(queue.len(), 3),
            _ => unreachable!(),
        }
    }

    #[test]
    fn flipper_rotates_to_next_connected_belt() {
        let mut rig = Rig::new(3, 3);
        rig.belt(1, 2, Direction::Down);
        rig.belt(1, 0, Direction::Up);
        let id = rig.place(Machine::new(1, 1, Direction::Right, MachineKind::flipper()));

        rig.deliver(id, "a", Direction::Left);
        assert!(matches!(rig.machines[id].kind, MachineKind::Flipper { output: Direction::Down, .. }));
        rig.deliver(id, "b", Direction::Left);
        assert!(matches!(rig.machines[id].kind, MachineKind::Flipper { output: Direction::Up, .. }));

        assert!(rig.emit(id));
        assert_eq!((rig.packets[0].x, rig.packets[0].y), (1, 0));
    }

    #[test]
    fn duplicator_waits_for_every_output() {
        let mut rig = Rig::new(3, 3);
        rig.belt(2, 1, Direction::Right);
        rig.belt(1, 2, Direction::Down);
        let id = rig.place(Machine::new(1, 1, Direction::Right, MachineKind::duplicator()));
        rig.deliver(id, "a", Direction::Left);

        rig.packets.push(Packet::entering(PacketId(99), 1, 2, Direction::Down, "x".into()));
        assert!(!rig.emit(id));
        rig.packets.clear();
        assert!(rig.emit(id));
        assert_eq!(rig.contents(), vec!["a", "a"]);
    }

    #[test]
    fn router_uses_both_outputs_in_one_tick() {
        let mut rig = Rig::new(3, 3);
        rig.belt(2, 1, Direction::Right);
        rig.belt(1, 2, Direction::Down);
        let id = rig.place(Machine::new(
            1,
            1,
            Direction::Right,
            MachineKind::router('a', Direction::Right, Direction::Down),
        ));
        rig.deliver(id, "b", Direction::Left);
        rig.deliver(id, "a", Direction::Left);
        assert!(rig.emit(id));
        assert_eq!(rig.packets.len(), 2);
        let right = rig.packets.iter().find(|p| p.x == 2).unwrap();
        assert_eq!(right.content, "a");
    }

    #[test]
    fn splitter_alternates_sides() {
        let mut rig = Rig::new(3, 3);
        rig.belt(1, 0, Direction::Right);
        rig.belt(1, 1, Direction::Right);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::splitter()));
        for c in ["a", "b", "c"] {
            rig.deliver(id, c, Direction::Left);
        }
        assert!(rig.emit(id));
        assert_eq!((rig.packets[0].y, rig.packets[0].content.as_str()), (0, "a"));
        assert!(rig.emit(id));
        assert_eq!((rig.packets[1].y, rig.packets[1].content.as_str()), (1, "b"));
        // both outputs now occupied
        assert!(!rig.emit(id));
        rig.packets.retain(|p| p.y == 1);
        // favored side is the first again, and it is free
        assert!(rig.emit(id));
        assert_eq!(rig.packets.last().unwrap().y, 0);
    }

    #[test]
    fn splitter_toggles_even_when_it_overflows() {
        let mut rig = Rig::new(3, 3);
        rig.belt(1, 0, Direction::Left);
        rig.belt(1, 1, Direction::Right);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::splitter()));
        for c in ["a", "b"] {
            rig.deliver(id, c, Direction::Left);
        }
        let favor_second = |rig: &Rig| match &rig.machines[id].kind {
            MachineKind::Splitter { favor_second, .. } => *favor_second,
            _ => unreachable!(),
        };

        // First side blocked: the packet leaves by the second cell.
        assert!(rig.emit(id));
        assert_eq!(rig.packets[0].y, 1);
        assert!(favor_second(&rig));

        // Second side now favored but occupied: overflow to the first.
        rig.belt(1, 0, Direction::Right);
        assert!(rig.emit(id));
        assert_eq!(rig.packets[1].y, 0);
        assert!(!favor_second(&rig));
    }

    #[test]
    fn speak_flushes_on_delimiter_and_skips_empty() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::speak('.')));
        assert!(rig.deliver(id, "h", Direction::Left));
        assert!(rig.deliver(id, "i", Direction::Left));
        assert!(rig.deliver(id, ".", Direction::Left));
        assert!(rig.deliver(id, ".", Direction::Left));

        match &rig.machines[id].kind {
            MachineKind::Speak {
                buffer,
                spoken,
                spoken_at,
                ..
            } => {
                assert_eq!(spoken, "hi");
                assert!(buffer.is_empty());
                assert!(spoken_at.is_some());
            }
            _ => unreachable!(),
        }
        let spoken: Vec<&str> = rig
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Speak { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(spoken, vec!["hi"]);
        assert!(!rig.emit(id), "speak is terminal");
    }

    #[test]
    fn wireless_broadcasts_to_same_channel_only() {
        let mut rig = Rig::new(3, 1);
        let sender = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::wireless(ChannelId(1))));
        let near = rig.place(Machine::new(1, 0, Direction::Right, MachineKind::wireless(ChannelId(1))));
        let far = rig.place(Machine::new(2, 0, Direction::Right, MachineKind::wireless(ChannelId(2))));
        assert!(rig.deliver(sender, "q", Direction::Left));

        let state = |id| match &rig.machines[id].kind {
            MachineKind::Wireless { queue, pulses, .. } => (queue.len(), *pulses),
            _ => unreachable!(),
        };
        assert_eq!(state(sender), (0, 1));
        assert_eq!(state(near), (1, 1));
        assert_eq!(state(far), (0, 0));
        assert!(rig.events.iter().any(|e| e.kind() == EventKind::WirelessTransmit));
    }

    #[test]
    fn math_and_replace_map_each_char() {
        let mut rig = Rig::new(2, 1);
        let math = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::math(MathOp::Add, 1)));
        let replace = rig.place(Machine::new(1, 0, Direction::Right, MachineKind::replace('a', 'z')));
        rig.deliver(math, "HAL", Direction::Left);
        rig.deliver(replace, "banana", Direction::Left);
        assert!(matches!(&rig.machines[math].kind, MachineKind::Math { queue, .. } if queue[0] == "IBM"));
        assert!(matches!(&rig.machines[replace].kind, MachineKind::Replace { queue, .. } if queue[0] == "bznznz"));
    }

    #[test]
    fn display_flushes_on_newline_and_timeout() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::display()));
        rig.deliver(id, "hi\n", Direction::Left);
        rig.deliver(id, "yo", Direction::Left);
        assert!(matches!(&rig.machines[id].kind, MachineKind::Display { shown, buffer, .. } if shown == "hi" && buffer == "yo"));

        let (mut frame, machines) = rig.frame();
        frame.now = ms(600.0);
        emit(&mut frame, id, &mut machines[id]);
        assert!(matches!(&rig.machines[id].kind, MachineKind::Display { shown, buffer, .. } if shown == "yo" && buffer.is_empty()));
    }

    #[test]
    fn side_effect_machines_raise_events() {
        let mut rig = Rig::new(4, 1);
        let drum = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::drum(DrumMode::Modulo)));
        let screen = rig.place(Machine::new(1, 0, Direction::Right, MachineKind::screen()));
        let tone = rig.place(Machine::new(2, 0, Direction::Right, MachineKind::tone(crate::machine::ToneVoice::Pitched)));
        let seg = rig.place(Machine::new(3, 0, Direction::Right, MachineKind::seven_seg()));
        rig.deliver(drum, "\u{6}", Direction::Left);
        rig.deliver(screen, "ok", Direction::Left);
        rig.deliver(tone, "E", Direction::Left);
        rig.deliver(seg, "7", Direction::Left);

        let kinds: Vec<_> = rig.events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::DrumHit,
                EventKind::ScreenWritten,
                EventKind::ScreenWritten,
                EventKind::ToneChanged,
                EventKind::SevenSegShown,
            ]
        );
        assert!(matches!(&rig.machines[screen].kind, MachineKind::Screen { cells, cursor } if cells[0] == b'o' && *cursor == 2));
        assert!(matches!(rig.machines[tone].kind, MachineKind::Tone { value: 69, .. }));
        assert!(matches!(rig.machines[drum].kind, MachineKind::Drum { last_samples: 0b0100, .. }));
    }

    #[test]
    fn tnt_explodes_at_threshold() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::tnt()));
        for _ in 0..19 {
            assert!(rig.deliver(id, "x", Direction::Left));
        }
        assert!(rig.orphans.is_empty());
        assert!(rig.deliver(id, "x", Direction::Left));
        assert_eq!(rig.orphans.len(), 20);
        assert!(!rig.deliver(id, "x", Direction::Left));
    }

    #[test]
    fn delays_release_after_their_age() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(0, 0, Direction::Right, MachineKind::delay(100.0)));
        rig.deliver(id, "a", Direction::Left);
        flush_delays(&mut rig.machines, ms(99.0));
        assert!(matches!(&rig.machines[id].kind, MachineKind::Delay { queue, .. } if queue.is_empty()));
        flush_delays(&mut rig.machines, ms(100.0));
        assert!(matches!(&rig.machines[id].kind, MachineKind::Delay { queue, pending, .. } if queue.len() == 1 && pending.is_empty()));
    }

    #[test]
    fn command_ignores_input_while_processing() {
        let mut rig = Rig::new(1, 1);
        let id = rig.place(Machine::new(
            0,
            0,
            Direction::Right,
            MachineKind::command(crate::machine::CommandMachine::new("cat", crate::machine::CommandMode::Line)),
        ));
        rig.deliver(id, "a", Direction::Left);
        rig.machines[id].as_command_mut().unwrap().processing = true;
        rig.deliver(id, "b", Direction::Left);
        assert_eq!(rig.machines[id].as_command().unwrap().pending_input, "a");
    }
}
