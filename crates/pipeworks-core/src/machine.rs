//! Machine data: the closed set of machine kinds and their runtime state.
//!
//! Behavior lives in [`crate::dispatch`]; this module only holds state,
//! construction and the start-of-simulation reset rules.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::fixed::{Fixed64, Millis, f64_to_fixed64};
use crate::id::ChannelId;
use crate::ring::RingBuffer;
use crate::timer::EmitTimer;

/// Cells in a screen machine's byte buffer.
pub const SCREEN_CELLS: usize = 64;

/// Default drain-ring size for sinks.
pub const SINK_RING_CAPACITY: usize = 16;

/// A queue of packet payloads waiting to be emitted.
pub type Queue = VecDeque<String>;

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

/// The byte value of a character, for byte-oriented machines.
pub fn byte_of(c: char) -> u8 {
    (c as u32 & 0xFF) as u8
}

/// The character for a byte value (Latin-1).
pub fn char_of(b: u8) -> char {
    char::from(b)
}

/// True when `content` is exactly the single character `c`.
pub fn is_exactly(content: &str, c: char) -> bool {
    let mut chars = content.chars();
    chars.next() == Some(c) && chars.next().is_none()
}

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a command machine, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Idle,
    Starting,
    Ready,
    Running,
    Error,
}

/// How a command machine feeds its input to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// One long-running process; input is written as it arrives.
    Stream,
    /// Each input line runs the command once with the line on stdin.
    #[default]
    Line,
    /// Each input line runs the command once with the line as an argument.
    Args,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Pass,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOp {
    #[default]
    Add,
    Sub,
    Mul,
    Mod,
    Xor,
    And,
    Or,
    Not,
}

impl MathOp {
    /// Apply the operation with 8-bit wraparound. `Mod` by zero passes the
    /// value through.
    pub fn apply(self, value: u8, operand: u8) -> u8 {
        match self {
            MathOp::Add => value.wrapping_add(operand),
            MathOp::Sub => value.wrapping_sub(operand),
            MathOp::Mul => value.wrapping_mul(operand),
            MathOp::Mod => {
                if operand == 0 {
                    value
                } else {
                    value % operand
                }
            }
            MathOp::Xor => value ^ operand,
            MathOp::And => value & operand,
            MathOp::Or => value | operand,
            MathOp::Not => !value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrumMode {
    /// The low four bits select which of four samples play.
    #[default]
    Bitmask,
    /// The value modulo 4 selects a single sample.
    Modulo,
}

impl DrumMode {
    /// Sample bitmask for a byte.
    pub fn samples(self, value: u8) -> u8 {
        match self {
            DrumMode::Bitmask => value & 0x0F,
            DrumMode::Modulo => 1 << (value % 4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneVoice {
    #[default]
    Pitched,
    Noise,
}

/// Frequency in Hz for a pitched voice: the byte is a MIDI note number in
/// equal temperament (A4 = note 69 = 440 Hz). 0 is silence.
pub fn tone_frequency(value: u8) -> f32 {
    if value == 0 {
        return 0.0;
    }
    440.0 * 2f32.powf((value as f32 - 69.0) / 12.0)
}

/// Clock rate in Hz for the noise voice. 0 is silence.
pub fn noise_clock_hz(value: u8) -> f32 {
    value as f32 * 100.0
}

/// Byte value of a punch-card row: eight holes, most significant bit first.
pub fn punch_row_value(row: &[bool; 8]) -> u8 {
    row.iter().fold(0u8, |acc, &hole| (acc << 1) | hole as u8)
}

// ---------------------------------------------------------------------------
// Emitters
// ---------------------------------------------------------------------------

/// Plays a sequence of payloads on a timer, optionally looping with a gap.
///
/// Shared by sources, byte streams and punch cards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEmitter {
    pub sequence: Vec<String>,
    pub looping: bool,
    pub gap_interval: Millis,
    pub cursor: usize,
    pub timer: EmitTimer,
    pub gap: EmitTimer,
    pub in_gap: bool,
    pub finished: bool,
}

impl SequenceEmitter {
    pub fn new(sequence: Vec<String>, interval: Millis, looping: bool, gap_interval: Millis) -> Self {
        Self {
            sequence,
            looping,
            gap_interval,
            cursor: 0,
            timer: EmitTimer::new(interval),
            gap: EmitTimer::delayed(gap_interval),
            in_gap: false,
            finished: false,
        }
    }

    /// Advance the timers by `dt` and return the payload that is due, if any.
    ///
    /// The payload is not consumed until [`SequenceEmitter::commit`].
    pub fn due(&mut self, dt: Millis) -> Option<&str> {
        if self.finished || self.sequence.is_empty() {
            return None;
        }
        if self.in_gap {
            self.gap.advance(dt);
            if !self.gap.should_tick() {
                return None;
            }
            self.in_gap = false;
            self.cursor = 0;
            self.timer.fire_with(self.gap.drift());
        } else {
            self.timer.advance(dt);
        }
        if !self.timer.should_tick() {
            return None;
        }
        self.sequence.get(self.cursor).map(String::as_str)
    }

    /// Record that the due payload was emitted.
    pub fn commit(&mut self) {
        self.cursor += 1;
        if self.cursor < self.sequence.len() {
            self.timer.restart();
        } else if !self.looping {
            self.finished = true;
        } else if self.gap_interval > Fixed64::ZERO {
            self.in_gap = true;
            self.gap.start(self.timer.drift());
        } else {
            self.cursor = 0;
            self.timer.restart();
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.timer.reset();
        self.gap.start(Fixed64::ZERO);
        self.in_gap = false;
        self.finished = false;
    }
}

/// Emits one fixed character every interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEmitter {
    pub content: char,
    pub timer: EmitTimer,
}

// ---------------------------------------------------------------------------
// Command machines
// ---------------------------------------------------------------------------

/// A machine that pipes packets through an external shell command.
///
/// Shell handles live in the simulation's bridge table, not here, so the
/// machine stays plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMachine {
    pub command: String,
    pub mode: CommandMode,
    pub auto_start: bool,
    pub cwd: String,

    /// Input received but not yet handed to the shell.
    pub pending_input: String,
    /// Shell output waiting to be emitted, one character per packet.
    pub output: VecDeque<char>,
    /// A line/args run is in flight; input is ignored meanwhile.
    pub processing: bool,
    pub status: CommandStatus,
    pub auto_started: bool,
    /// Stream mode: the long-running command has been issued.
    pub stream_started: bool,
    pub run_started_at: Option<Millis>,
}

impl CommandMachine {
    pub fn new(command: impl Into<String>, mode: CommandMode) -> Self {
        Self {
            command: command.into(),
            mode,
            auto_start: false,
            cwd: "/".to_string(),
            pending_input: String::new(),
            output: VecDeque::new(),
            processing: false,
            status: CommandStatus::Idle,
            auto_started: false,
            stream_started: false,
            run_started_at: None,
        }
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Take the first complete input line, without its newline.
    pub fn take_line(&mut self) -> Option<String> {
        let end = self.pending_input.find('\n')?;
        let line = self.pending_input[..end].to_string();
        self.pending_input.drain(..=end);
        Some(line)
    }

    pub fn reset(&mut self) {
        self.pending_input.clear();
        self.output.clear();
        self.processing = false;
        self.status = CommandStatus::Idle;
        self.auto_started = false;
        self.stream_started = false;
        self.run_started_at = None;
    }
}

// ---------------------------------------------------------------------------
// Machine kinds
// ---------------------------------------------------------------------------

/// Every machine variant with its configuration and runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineKind {
    Source(SequenceEmitter),
    Byte(SequenceEmitter),
    PunchCard(SequenceEmitter),
    Linefeed(TimedEmitter),
    Clock(TimedEmitter),
    Sink {
        ring: RingBuffer<String>,
        received: u64,
    },
    Display {
        buffer: String,
        shown: String,
        shown_at: Option<Millis>,
        last_input_at: Option<Millis>,
    },
    Speak {
        delimiter: char,
        buffer: String,
        spoken: String,
        spoken_at: Option<Millis>,
    },
    Command(CommandMachine),
    Null,
    Flipper {
        output: Direction,
        queue: Queue,
    },
    Duplicator {
        queue: Queue,
    },
    Filter {
        byte: char,
        mode: FilterMode,
        queue: Queue,
    },
    Counter {
        trigger: char,
        count: u64,
        queue: Queue,
    },
    Delay {
        delay_ms: Millis,
        /// Payloads with their arrival time, oldest first.
        pending: VecDeque<(String, Millis)>,
        queue: Queue,
    },
    Keyboard {
        queue: Queue,
    },
    Button {
        content: char,
        presses: u32,
    },
    Packer {
        delimiter: char,
        include_delimiter: bool,
        buffer: String,
        queue: Queue,
    },
    Unpacker {
        queue: Queue,
    },
    Router {
        match_byte: char,
        match_direction: Direction,
        else_direction: Direction,
        match_queue: Queue,
        else_queue: Queue,
    },
    Gate {
        data_direction: Direction,
        control_direction: Direction,
        open: bool,
        queue: Queue,
    },
    Latch {
        data_direction: Direction,
        control_direction: Direction,
        stored: Option<String>,
        queue: Queue,
    },
    Wireless {
        channel: ChannelId,
        queue: Queue,
        /// Animation counter, bumped on every send and receive.
        pulses: u32,
    },
    Replace {
        from: char,
        to: char,
        queue: Queue,
    },
    Math {
        op: MathOp,
        operand: u8,
        queue: Queue,
    },
    Splitter {
        queue: Queue,
        /// The next emission tries the second cell first.
        favor_second: bool,
    },
    SevenSeg {
        value: Option<char>,
        queue: Queue,
    },
    Drum {
        mode: DrumMode,
        last_samples: u8,
        queue: Queue,
    },
    Tone {
        voice: ToneVoice,
        value: u8,
    },
    Screen {
        cells: Vec<u8>,
        cursor: usize,
    },
    Tnt {
        stored: Vec<String>,
        exploded: bool,
    },
}

fn millis(ms: f64) -> Millis {
    f64_to_fixed64(ms.max(0.0))
}

impl MachineKind {
    /// Emits the characters of `text`.
    pub fn source(text: &str, interval_ms: f64, looping: bool, gap_ms: f64) -> Self {
        let sequence = text.chars().map(String::from).collect();
        MachineKind::Source(SequenceEmitter::new(
            sequence,
            millis(interval_ms),
            looping,
            millis(gap_ms),
        ))
    }

    /// Emits raw byte values.
    pub fn byte(bytes: &[u8], interval_ms: f64, looping: bool, gap_ms: f64) -> Self {
        let sequence = bytes.iter().map(|&b| char_of(b).to_string()).collect();
        MachineKind::Byte(SequenceEmitter::new(
            sequence,
            millis(interval_ms),
            looping,
            millis(gap_ms),
        ))
    }

    /// Emits one byte per punched row.
    pub fn punch_card(rows: &[[bool; 8]], interval_ms: f64, looping: bool, gap_ms: f64) -> Self {
        let sequence = rows
            .iter()
            .map(|row| char_of(punch_row_value(row)).to_string())
            .collect();
        MachineKind::PunchCard(SequenceEmitter::new(
            sequence,
            millis(interval_ms),
            looping,
            millis(gap_ms),
        ))
    }

    pub fn linefeed(interval_ms: f64) -> Self {
        MachineKind::Linefeed(TimedEmitter {
            content: '\n',
            timer: EmitTimer::new(millis(interval_ms)),
        })
    }

    pub fn clock(content: char, interval_ms: f64) -> Self {
        MachineKind::Clock(TimedEmitter {
            content,
            timer: EmitTimer::new(millis(interval_ms)),
        })
    }

    pub fn sink() -> Self {
        Self::sink_with_capacity(SINK_RING_CAPACITY)
    }

    pub fn sink_with_capacity(capacity: usize) -> Self {
        MachineKind::Sink {
            ring: RingBuffer::new(capacity),
            received: 0,
        }
    }

    pub fn display() -> Self {
        MachineKind::Display {
            buffer: String::new(),
            shown: String::new(),
            shown_at: None,
            last_input_at: None,
        }
    }

    pub fn speak(delimiter: char) -> Self {
        MachineKind::Speak {
            delimiter,
            buffer: String::new(),
            spoken: String::new(),
            spoken_at: None,
        }
    }

    pub fn command(command: CommandMachine) -> Self {
        MachineKind::Command(command)
    }

    pub fn flipper() -> Self {
        MachineKind::Flipper {
            output: Direction::Right,
            queue: Queue::new(),
        }
    }

    pub fn duplicator() -> Self {
        MachineKind::Duplicator { queue: Queue::new() }
    }

    pub fn filter(byte: char, mode: FilterMode) -> Self {
        MachineKind::Filter {
            byte,
            mode,
            queue: Queue::new(),
        }
    }

    pub fn counter(trigger: char) -> Self {
        MachineKind::Counter {
            trigger,
            count: 0,
            queue: Queue::new(),
        }
    }

    pub fn delay(delay_ms: f64) -> Self {
        MachineKind::Delay {
            delay_ms: millis(delay_ms),
            pending: VecDeque::new(),
            queue: Queue::new(),
        }
    }

    pub fn keyboard() -> Self {
        MachineKind::Keyboard { queue: Queue::new() }
    }

    pub fn button(content: char) -> Self {
        MachineKind::Button {
            content,
            presses: 0,
        }
    }

    pub fn packer(delimiter: char, include_delimiter: bool) -> Self {
        MachineKind::Packer {
            delimiter,
            include_delimiter,
            buffer: String::new(),
            queue: Queue::new(),
        }
    }

    pub fn unpacker() -> Self {
        MachineKind::Unpacker { queue: Queue::new() }
    }

    pub fn router(match_byte: char, match_direction: Direction, else_direction: Direction) -> Self {
        MachineKind::Router {
            match_byte,
            match_direction,
            else_direction,
            match_queue: Queue::new(),
            else_queue: Queue::new(),
        }
    }

    pub fn gate(data_direction: Direction, control_direction: Direction) -> Self {
        MachineKind::Gate {
            data_direction,
            control_direction,
            open: false,
            queue: Queue::new(),
        }
    }

    pub fn latch(data_direction: Direction, control_direction: Direction) -> Self {
        MachineKind::Latch {
            data_direction,
            control_direction,
            stored: None,
            queue: Queue::new(),
        }
    }

    pub fn wireless(channel: ChannelId) -> Self {
        MachineKind::Wireless {
            channel,
            queue: Queue::new(),
            pulses: 0,
        }
    }

    pub fn replace(from: char, to: char) -> Self {
        MachineKind::Replace {
            from,
            to,
            queue: Queue::new(),
        }
    }

    pub fn math(op: MathOp, operand: u8) -> Self {
        MachineKind::Math {
            op,
            operand,
            queue: Queue::new(),
        }
    }

    pub fn splitter() -> Self {
        MachineKind::Splitter {
            queue: Queue::new(),
            favor_second: false,
        }
    }

    pub fn seven_seg() -> Self {
        MachineKind::SevenSeg {
            value: None,
            queue: Queue::new(),
        }
    }

    pub fn drum(mode: DrumMode) -> Self {
        MachineKind::Drum {
            mode,
            last_samples: 0,
            queue: Queue::new(),
        }
    }

    pub fn tone(voice: ToneVoice) -> Self {
        MachineKind::Tone { voice, value: 0 }
    }

    pub fn screen() -> Self {
        MachineKind::Screen {
            cells: vec![0; SCREEN_CELLS],
            cursor: 0,
        }
    }

    pub fn tnt() -> Self {
        MachineKind::Tnt {
            stored: Vec::new(),
            exploded: false,
        }
    }

    /// Short lowercase name, as used in layout files and logs.
    pub fn name(&self) -> &'static str {
        match self {
            MachineKind::Source(_) => "source",
            MachineKind::Byte(_) => "byte",
            MachineKind::PunchCard(_) => "punch_card",
            MachineKind::Linefeed(_) => "linefeed",
            MachineKind::Clock(_) => "clock",
            MachineKind::Sink { .. } => "sink",
            MachineKind::Display { .. } => "display",
            MachineKind::Speak { .. } => "speak",
            MachineKind::Command(_) => "command",
            MachineKind::Null => "null",
            MachineKind::Flipper { .. } => "flipper",
            MachineKind::Duplicator { .. } => "duplicator",
            MachineKind::Filter { .. } => "filter",
            MachineKind::Counter { .. } => "counter",
            MachineKind::Delay { .. } => "delay",
            MachineKind::Keyboard { .. } => "keyboard",
            MachineKind::Button { .. } => "button",
            MachineKind::Packer { .. } => "packer",
            MachineKind::Unpacker { .. } => "unpacker",
            MachineKind::Router { .. } => "router",
            MachineKind::Gate { .. } => "gate",
            MachineKind::Latch { .. } => "latch",
            MachineKind::Wireless { .. } => "wireless",
            MachineKind::Replace { .. } => "replace",
            MachineKind::Math { .. } => "math",
            MachineKind::Splitter { .. } => "splitter",
            MachineKind::SevenSeg { .. } => "seven_seg",
            MachineKind::Drum { .. } => "drum",
            MachineKind::Tone { .. } => "tone",
            MachineKind::Screen { .. } => "screen",
            MachineKind::Tnt { .. } => "tnt",
        }
    }

    /// Number of grid cells the machine occupies.
    pub fn footprint(&self) -> usize {
        match self {
            MachineKind::Splitter { .. } => 2,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// A placed machine: position, facing and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub x: i32,
    pub y: i32,
    /// The forward output direction.
    pub direction: Direction,
    /// Simulated time of the last emission or accepted delivery, for
    /// renderer highlights.
    pub last_command_time: Option<Millis>,
    pub kind: MachineKind,
}

impl Machine {
    /// Place a machine. Runtime state starts at its reset values.
    pub fn new(x: i32, y: i32, direction: Direction, kind: MachineKind) -> Self {
        let mut machine = Self {
            x,
            y,
            direction,
            last_command_time: None,
            kind,
        };
        machine.reset();
        machine
    }

    /// Cells covered by the machine. The second splitter cell sits one step
    /// clockwise of the facing direction.
    pub fn cells(&self) -> Vec<(i32, i32)> {
        match self.kind {
            MachineKind::Splitter { .. } => {
                let (dx, dy) = self.direction.rotate_cw().delta();
                vec![(self.x, self.y), (self.x + dx, self.y + dy)]
            }
            _ => vec![(self.x, self.y)],
        }
    }

    /// Restore the start-of-simulation runtime state, keeping configuration.
    pub fn reset(&mut self) {
        self.last_command_time = None;
        let facing = self.direction;
        match &mut self.kind {
            MachineKind::Source(seq) | MachineKind::Byte(seq) | MachineKind::PunchCard(seq) => {
                seq.reset();
            }
            MachineKind::Linefeed(timed) | MachineKind::Clock(timed) => timed.timer.reset(),
            MachineKind::Sink { ring, received } => {
                ring.clear();
                *received = 0;
            }
            MachineKind::Display {
                buffer,
                shown,
                shown_at,
                last_input_at,
            } => {
                buffer.clear();
                shown.clear();
                *shown_at = None;
                *last_input_at = None;
            }
            MachineKind::Speak {
                buffer,
                spoken,
                spoken_at,
                ..
            } => {
                buffer.clear();
                spoken.clear();
                *spoken_at = None;
            }
            MachineKind::Command(command) => command.reset(),
            MachineKind::Null => {}
            MachineKind::Flipper { output, queue } => {
                *output = facing;
                queue.clear();
            }
            MachineKind::Counter { count, queue, .. } => {
                *count = 0;
                queue.clear();
            }
            MachineKind::Delay { pending, queue, .. } => {
                pending.clear();
                queue.clear();
            }
            MachineKind::Button { presses, .. } => *presses = 0,
            MachineKind::Packer { buffer, queue, .. } => {
                buffer.clear();
                queue.clear();
            }
            MachineKind::Router {
                match_queue,
                else_queue,
                ..
            } => {
                match_queue.clear();
                else_queue.clear();
            }
            MachineKind::Gate { open, queue, .. } => {
                *open = false;
                queue.clear();
            }
            MachineKind::Latch { stored, queue, .. } => {
                *stored = None;
                queue.clear();
            }
            MachineKind::Wireless { queue, pulses, .. } => {
                queue.clear();
                *pulses = 0;
            }
            MachineKind::Splitter {
                queue,
                favor_second,
            } => {
                queue.clear();
                *favor_second = false;
            }
            MachineKind::SevenSeg { value, queue } => {
                *value = None;
                queue.clear();
            }
            MachineKind::Drum {
                last_samples,
                queue,
                ..
            } => {
                *last_samples = 0;
                queue.clear();
            }
            MachineKind::Tone { value, .. } => *value = 0,
            MachineKind::Screen { cells, cursor } => {
                cells.clear();
                cells.resize(SCREEN_CELLS, 0);
                *cursor = 0;
            }
            MachineKind::Tnt { stored, exploded } => {
                stored.clear();
                *exploded = false;
            }
            MachineKind::Duplicator { queue }
            | MachineKind::Filter { queue, .. }
            | MachineKind::Keyboard { queue }
            | MachineKind::Unpacker { queue }
            | MachineKind::Replace { queue, .. }
            | MachineKind::Math { queue, .. } => queue.clear(),
        }
    }

    pub fn as_command(&self) -> Option<&CommandMachine> {
        match &self.kind {
            MachineKind::Command(command) => Some(command),
            _ => None,
        }
    }

    pub fn as_command_mut(&mut self) -> Option<&mut CommandMachine> {
        match &mut self.kind {
            MachineKind::Command(command) => Some(command),
            _ => None,
        }
    }

    /// Contents of a sink's drain ring, oldest first.
    pub fn sink_contents(&self) -> Option<Vec<String>> {
        match &self.kind {
            MachineKind::Sink { ring, .. } => Some(ring.to_vec()),
            _ => None,
        }
    }
}
