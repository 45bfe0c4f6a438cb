//! Typed simulation events buffered in a ring.
//!
//! Events are emitted during a frame and delivered in batch to passive
//! listeners at the end of the frame. The host drains the buffer whenever it
//! likes; nothing in the simulation ever waits on a listener.
//!
//! # Suppression
//!
//! Event kinds can be suppressed via [`EventBus::suppress`]. Suppressed events
//! are never buffered nor delivered.

use crate::fixed::{Millis, Ticks};
use crate::id::{ChannelId, MachineId, PacketId};
use crate::machine::{CommandStatus, ToneVoice};
use crate::ring::RingBuffer;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A simulation event. All events carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // -- Transport --
    PacketEmitted {
        machine: MachineId,
        packet: PacketId,
        tick: Ticks,
    },
    PacketOrphaned {
        packet: PacketId,
        tick: Ticks,
    },

    // -- Terminals --
    SinkReceived {
        machine: MachineId,
        content: String,
        tick: Ticks,
    },
    DisplayFlushed {
        machine: MachineId,
        text: String,
        tick: Ticks,
    },
    Speak {
        machine: MachineId,
        text: String,
        tick: Ticks,
    },
    Packed {
        machine: MachineId,
        len: usize,
        tick: Ticks,
    },

    // -- Side effects for audio/visual collaborators --
    DrumHit {
        machine: MachineId,
        /// Bit `n` set means sample `n` plays.
        samples: u8,
        tick: Ticks,
    },
    ToneChanged {
        machine: MachineId,
        voice: ToneVoice,
        /// 0 is silence.
        value: u8,
        tick: Ticks,
    },
    SevenSegShown {
        machine: MachineId,
        value: char,
        tick: Ticks,
    },
    ScreenWritten {
        machine: MachineId,
        index: usize,
        value: u8,
        tick: Ticks,
    },
    WirelessTransmit {
        machine: MachineId,
        channel: ChannelId,
        content: String,
        tick: Ticks,
    },
    Exploded {
        machine: MachineId,
        fragments: usize,
        tick: Ticks,
    },

    // -- Command bridge --
    CommandStatusChanged {
        machine: MachineId,
        status: CommandStatus,
        tick: Ticks,
    },
    CommandCompleted {
        machine: MachineId,
        bytes: usize,
        duration_ms: Millis,
        tick: Ticks,
    },
    CommandStderr {
        machine: MachineId,
        text: String,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketEmitted,
    PacketOrphaned,
    SinkReceived,
    DisplayFlushed,
    Speak,
    Packed,
    DrumHit,
    ToneChanged,
    SevenSegShown,
    ScreenWritten,
    WirelessTransmit,
    Exploded,
    CommandStatusChanged,
    CommandCompleted,
    CommandStderr,
}

/// Total number of event kinds.
const EVENT_KIND_COUNT: usize = 15;

impl Event {
    /// Get the discriminant kind for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PacketEmitted { .. } => EventKind::PacketEmitted,
            Event::PacketOrphaned { .. } => EventKind::PacketOrphaned,
            Event::SinkReceived { .. } => EventKind::SinkReceived,
            Event::DisplayFlushed { .. } => EventKind::DisplayFlushed,
            Event::Speak { .. } => EventKind::Speak,
            Event::Packed { .. } => EventKind::Packed,
            Event::DrumHit { .. } => EventKind::DrumHit,
            Event::ToneChanged { .. } => EventKind::ToneChanged,
            Event::SevenSegShown { .. } => EventKind::SevenSegShown,
            Event::ScreenWritten { .. } => EventKind::ScreenWritten,
            Event::WirelessTransmit { .. } => EventKind::WirelessTransmit,
            Event::Exploded { .. } => EventKind::Exploded,
            Event::CommandStatusChanged { .. } => EventKind::CommandStatusChanged,
            Event::CommandCompleted { .. } => EventKind::CommandCompleted,
            Event::CommandStderr { .. } => EventKind::CommandStderr,
        }
    }

    /// The machine that raised the event, if any.
    pub fn machine(&self) -> Option<MachineId> {
        match self {
            Event::PacketOrphaned { .. } => None,
            Event::PacketEmitted { machine, .. }
            | Event::SinkReceived { machine, .. }
            | Event::DisplayFlushed { machine, .. }
            | Event::Speak { machine, .. }
            | Event::Packed { machine, .. }
            | Event::DrumHit { machine, .. }
            | Event::ToneChanged { machine, .. }
            | Event::SevenSegShown { machine, .. }
            | Event::ScreenWritten { machine, .. }
            | Event::WirelessTransmit { machine, .. }
            | Event::Exploded { machine, .. }
            | Event::CommandStatusChanged { machine, .. }
            | Event::CommandCompleted { machine, .. }
            | Event::CommandStderr { machine, .. } => Some(*machine),
        }
    }
}

impl EventKind {
    /// Convert to usize index for array lookups.
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// A passive listener receives events read-only.
pub type PassiveListener = Box<dyn FnMut(&Event)>;

struct ListenerEntry {
    /// `None` listens to every kind.
    kind: Option<EventKind>,
    listener: PassiveListener,
}

impl std::fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("kind", &self.kind)
            .field("listener", &"<fn>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// The simulation's output queue of events.
pub struct EventBus {
    buffer: RingBuffer<Event>,
    suppressed: [bool; EVENT_KIND_COUNT],
    listeners: Vec<ListenerEntry>,
    /// `buffer.total_written()` as of the last delivery.
    delivered_through: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffered", &self.buffer.len())
            .field("suppressed", &self.suppressed)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events before dropping the
    /// oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
            suppressed: [false; EVENT_KIND_COUNT],
            listeners: Vec::new(),
            delivered_through: 0,
        }
    }

    /// Suppress an event kind.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
    }

    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Buffer an event. No-ops if its kind is suppressed.
    pub fn emit(&mut self, event: Event) {
        if self.suppressed[event.kind().index()] {
            return;
        }
        self.buffer.push(event);
    }

    /// Register a passive listener for one event kind.
    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.listeners.push(ListenerEntry {
            kind: Some(kind),
            listener,
        });
    }

    /// Register a passive listener for every event kind.
    pub fn on_any(&mut self, listener: PassiveListener) {
        self.listeners.push(ListenerEntry {
            kind: None,
            listener,
        });
    }

    /// Hand every event buffered since the last delivery to the listeners,
    /// in emission order. Events stay buffered for the host to drain.
    pub fn deliver(&mut self) {
        let total = self.buffer.total_written();
        let fresh = (total - self.delivered_through).min(self.buffer.len() as u64) as usize;
        self.delivered_through = total;
        if fresh == 0 || self.listeners.is_empty() {
            return;
        }

        let skip = self.buffer.len() - fresh;
        for event in self.buffer.iter().skip(skip) {
            let kind = event.kind();
            for entry in &mut self.listeners {
                if entry.kind.is_none_or(|k| k == kind) {
                    (entry.listener)(event);
                }
            }
        }
    }

    /// Remove and return every buffered event, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        self.buffer.drain()
    }

    /// Iterate buffered events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Events lost because the host did not drain fast enough.
    pub fn dropped_count(&self) -> u64 {
        self.buffer.dropped_count()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.delivered_through = self.buffer.total_written();
    }
}
