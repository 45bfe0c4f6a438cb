//! Data-driven layout loading from JSON.
//!
//! Feature-gated behind `data-loader`. A layout names the grid size, optional
//! tunables, belts and machines; loading places everything on a fresh,
//! stopped [`Simulation`].
//!
//! ```json
//! {
//!   "width": 4, "height": 1,
//!   "belts": [{ "x": 1, "y": 0, "direction": "right" }],
//!   "machines": [
//!     { "x": 0, "y": 0, "direction": "right", "type": "source", "text": "hi\n" },
//!     { "x": 2, "y": 0, "type": "command", "command": "rev" }
//!   ]
//! }
//! ```

use crate::direction::Direction;
use crate::engine::Simulation;
use crate::grid::GridError;
use crate::id::ChannelId;
use crate::machine::{
    CommandMachine, CommandMode, DrumMode, FilterMode, MachineKind, MathOp, ToneVoice,
};
use crate::sim::SimConfig;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during layout loading.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("grid error: {0}")]
    Grid(#[from] GridError),
    #[error("layout must be at least 1x1, got {width}x{height}")]
    EmptyGrid { width: u32, height: u32 },
}

// ---------------------------------------------------------------------------
// JSON data structures
// ---------------------------------------------------------------------------

/// Top-level layout structure for JSON deserialization.
#[derive(Debug, serde::Deserialize)]
pub struct LayoutData {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub config: SimConfig,
    #[serde(default)]
    pub belts: Vec<BeltData>,
    #[serde(default)]
    pub machines: Vec<MachineData>,
}

#[derive(Debug, serde::Deserialize)]
pub struct BeltData {
    pub x: i32,
    pub y: i32,
    pub direction: Direction,
}

#[derive(Debug, serde::Deserialize)]
pub struct MachineData {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(flatten)]
    pub kind: MachineKindData,
}

fn default_interval() -> f64 {
    500.0
}

fn newline() -> char {
    '\n'
}

fn root() -> String {
    "/".to_string()
}

/// JSON representation of a machine kind, tagged by `type`.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MachineKindData {
    Source {
        text: String,
        #[serde(default = "default_interval")]
        interval_ms: f64,
        #[serde(default, rename = "loop")]
        looping: bool,
        #[serde(default)]
        gap_ms: f64,
    },
    Byte {
        bytes: Vec<u8>,
        #[serde(default = "default_interval")]
        interval_ms: f64,
        #[serde(default, rename = "loop")]
        looping: bool,
        #[serde(default)]
        gap_ms: f64,
    },
    PunchCard {
        rows: Vec<[bool; 8]>,
        #[serde(default = "default_interval")]
        interval_ms: f64,
        #[serde(default, rename = "loop")]
        looping: bool,
        #[serde(default)]
        gap_ms: f64,
    },
    Linefeed {
        #[serde(default = "default_interval")]
        interval_ms: f64,
    },
    Clock {
        content: char,
        #[serde(default = "default_interval")]
        interval_ms: f64,
    },
    Sink,
    Display,
    Speak {
        #[serde(default = "newline")]
        delimiter: char,
    },
    Command {
        command: String,
        #[serde(default)]
        mode: CommandMode,
        #[serde(default)]
        auto_start: bool,
        #[serde(default = "root")]
        cwd: String,
    },
    Null,
    Flipper,
    Duplicator,
    Filter {
        byte: char,
        #[serde(default)]
        mode: FilterMode,
    },
    Counter {
        #[serde(default = "newline")]
        trigger: char,
    },
    Delay {
        delay_ms: f64,
    },
    Keyboard,
    Button {
        content: char,
    },
    Packer {
        #[serde(default = "newline")]
        delimiter: char,
        #[serde(default)]
        include_delimiter: bool,
    },
    Unpacker,
    Router {
        match_byte: char,
        match_direction: Direction,
        else_direction: Direction,
    },
    Gate {
        data_direction: Direction,
        control_direction: Direction,
    },
    Latch {
        data_direction: Direction,
        control_direction: Direction,
    },
    Wireless {
        #[serde(default)]
        channel: u16,
    },
    Replace {
        from: char,
        to: char,
    },
    Math {
        op: MathOp,
        #[serde(default)]
        operand: u8,
    },
    Splitter,
    SevenSeg,
    Drum {
        #[serde(default)]
        mode: DrumMode,
    },
    Tone {
        #[serde(default)]
        voice: ToneVoice,
    },
    Screen,
    Tnt,
}

impl MachineKindData {
    /// Build the machine kind. Sinks take their ring size from `config`.
    pub fn build(&self, config: &SimConfig) -> MachineKind {
        match self {
            MachineKindData::Source {
                text,
                interval_ms,
                looping,
                gap_ms,
            } => MachineKind::source(text, *interval_ms, *looping, *gap_ms),
            MachineKindData::Byte {
                bytes,
                interval_ms,
                looping,
                gap_ms,
            } => MachineKind::byte(bytes, *interval_ms, *looping, *gap_ms),
            MachineKindData::PunchCard {
                rows,
                interval_ms,
                looping,
                gap_ms,
            } => MachineKind::punch_card(rows, *interval_ms, *looping, *gap_ms),
            MachineKindData::Linefeed { interval_ms } => MachineKind::linefeed(*interval_ms),
            MachineKindData::Clock {
                content,
                interval_ms,
            } => MachineKind::clock(*content, *interval_ms),
            MachineKindData::Sink => MachineKind::sink_with_capacity(config.sink_ring_capacity),
            MachineKindData::Display => MachineKind::display(),
            MachineKindData::Speak { delimiter } => MachineKind::speak(*delimiter),
            MachineKindData::Command {
                command,
                mode,
                auto_start,
                cwd,
            } => MachineKind::command(
                CommandMachine::new(command.clone(), *mode)
                    .with_auto_start(*auto_start)
                    .with_cwd(cwd.clone()),
            ),
            MachineKindData::Null => MachineKind::Null,
            MachineKindData::Flipper => MachineKind::flipper(),
            MachineKindData::Duplicator => MachineKind::duplicator(),
            MachineKindData::Filter { byte, mode } => MachineKind::filter(*byte, *mode),
            MachineKindData::Counter { trigger } => MachineKind::counter(*trigger),
            MachineKindData::Delay { delay_ms } => MachineKind::delay(*delay_ms),
            MachineKindData::Keyboard => MachineKind::keyboard(),
            MachineKindData::Button { content } => MachineKind::button(*content),
            MachineKindData::Packer {
                delimiter,
                include_delimiter,
            } => MachineKind::packer(*delimiter, *include_delimiter),
            MachineKindData::Unpacker => MachineKind::unpacker(),
            MachineKindData::Router {
                match_byte,
                match_direction,
                else_direction,
            } => MachineKind::router(*match_byte, *match_direction, *else_direction),
            MachineKindData::Gate {
                data_direction,
                control_direction,
            } => MachineKind::gate(*data_direction, *control_direction),
            MachineKindData::Latch {
                data_direction,
                control_direction,
            } => MachineKind::latch(*data_direction, *control_direction),
            MachineKindData::Wireless { channel } => MachineKind::wireless(ChannelId(*channel)),
            MachineKindData::Replace { from, to } => MachineKind::replace(*from, *to),
            MachineKindData::Math { op, operand } => MachineKind::math(*op, *operand),
            MachineKindData::Splitter => MachineKind::splitter(),
            MachineKindData::SevenSeg => MachineKind::seven_seg(),
            MachineKindData::Drum { mode } => MachineKind::drum(*mode),
            MachineKindData::Tone { voice } => MachineKind::tone(*voice),
            MachineKindData::Screen => MachineKind::screen(),
            MachineKindData::Tnt => MachineKind::tnt(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading functions
// ---------------------------------------------------------------------------

/// Load a stopped simulation from a JSON string.
pub fn load_layout_json(json: &str) -> Result<Simulation, LayoutError> {
    let data: LayoutData = serde_json::from_str(json)?;
    build_simulation(data)
}

/// Load a stopped simulation from JSON bytes.
pub fn load_layout_json_bytes(bytes: &[u8]) -> Result<Simulation, LayoutError> {
    let data: LayoutData = serde_json::from_slice(bytes)?;
    build_simulation(data)
}

/// Place belts first, then machines in listing order. A later entry
/// overwrites an earlier one in the same cell.
pub fn build_simulation(data: LayoutData) -> Result<Simulation, LayoutError> {
    if data.width == 0 || data.height == 0 {
        return Err(LayoutError::EmptyGrid {
            width: data.width,
            height: data.height,
        });
    }
    let mut sim = Simulation::with_config(data.width, data.height, data.config);
    for belt in &data.belts {
        sim.set_belt(belt.x, belt.y, belt.direction)?;
    }
    for machine in &data.machines {
        let kind = machine.kind.build(sim.config());
        sim.place_machine(machine.x, machine.y, machine.direction, kind)?;
    }
    log::debug!(
        "loaded {}x{} layout: {} belts, {} machines",
        data.width,
        data.height,
        data.belts.len(),
        sim.machine_count()
    );
    Ok(sim)
}
