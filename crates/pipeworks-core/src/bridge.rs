//! The command-machine shell bridge.
//!
//! Each command machine gets a [`ShellLink`] the first time it has work. The
//! link walks `Idle -> Pending -> Ready` as the executor hands back a
//! session, and from then on the bridge writes input and polls output once
//! per frame without ever blocking. Every link is stamped with the bridge
//! epoch; [`CommandBridge::cancel_all`] bumps the epoch and drops every link,
//! so a result that resolves after a stop has nowhere to land.

use std::task::Poll;

use slotmap::{SecondaryMap, SlotMap};

use crate::event::{Event, EventBus};
use crate::fixed::{Millis, Ticks, f64_to_fixed64};
use crate::id::MachineId;
use crate::machine::{CommandMachine, CommandMode, CommandStatus, Machine};
use crate::marker::{MarkerRun, RunInput};
use crate::shell::{PendingRead, PendingSession, ShellError, ShellExecutor, ShellSession};
use crate::sim::SimConfig;

// ---------------------------------------------------------------------------
// Per-machine link
// ---------------------------------------------------------------------------

enum SessionState {
    /// No session. A failed one may only be reopened after `retry_at`.
    Idle { retry_at: Option<Millis> },
    Pending(PendingSession),
    Ready(Box<dyn ShellSession>),
}

/// Bridge-side state for one command machine.
pub(crate) struct ShellLink {
    epoch: u64,
    session: SessionState,
    /// At most one outstanding read per stream.
    stdout: Option<PendingRead>,
    stderr: Option<PendingRead>,
    run: Option<MarkerRun>,
    seq: u64,
}

impl std::fmt::Debug for ShellLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = match &self.session {
            SessionState::Idle { .. } => "idle",
            SessionState::Pending(_) => "pending",
            SessionState::Ready(_) => "ready",
        };
        f.debug_struct("ShellLink")
            .field("epoch", &self.epoch)
            .field("session", &session)
            .field("run", &self.run)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl ShellLink {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            session: SessionState::Idle { retry_at: None },
            stdout: None,
            stderr: None,
            run: None,
            seq: 0,
        }
    }

    fn stop(&mut self) {
        if let SessionState::Ready(session) = &mut self.session {
            session.stop();
        }
        self.session = SessionState::Idle { retry_at: None };
        self.stdout = None;
        self.stderr = None;
        self.run = None;
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Owns the shell executor and one link per active command machine.
#[derive(Default)]
pub struct CommandBridge {
    executor: Option<Box<dyn ShellExecutor>>,
    links: SecondaryMap<MachineId, ShellLink>,
    epoch: u64,
}

impl std::fmt::Debug for CommandBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBridge")
            .field("executor", &self.executor.as_ref().map(|_| "<executor>"))
            .field("links", &self.links)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Everything a link needs from the simulation for one frame.
pub(crate) struct BridgeFrame<'a> {
    pub events: &'a mut EventBus,
    pub config: &'a SimConfig,
    pub tick: Ticks,
    pub now: Millis,
}

impl CommandBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_executor(&mut self, executor: Box<dyn ShellExecutor>) {
        self.executor = Some(executor);
    }

    pub fn has_executor(&self) -> bool {
        self.executor.is_some()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of machines currently holding a link.
    pub fn active_links(&self) -> usize {
        self.links.len()
    }

    /// Stop every session and invalidate anything still in flight.
    pub fn cancel_all(&mut self) {
        for (_, link) in self.links.iter_mut() {
            link.stop();
        }
        self.links.clear();
        self.epoch += 1;
        log::debug!("shell bridge reset, epoch {}", self.epoch);
    }

    /// Drop the link of a machine that was removed from the grid.
    pub fn forget(&mut self, id: MachineId) {
        if let Some(mut link) = self.links.remove(id) {
            link.stop();
        }
    }

    /// Advance every command machine's shell state by one frame.
    pub(crate) fn drive(&mut self, machines: &mut SlotMap<MachineId, Machine>, frame: &mut BridgeFrame<'_>) {
        let CommandBridge {
            executor,
            links,
            epoch,
        } = self;

        for (id, machine) in machines.iter_mut() {
            let Some(command) = machine.as_command_mut() else {
                continue;
            };

            if links.get(id).is_some_and(|link| link.epoch != *epoch) {
                if let Some(mut stale) = links.remove(id) {
                    stale.stop();
                }
            }
            if !links.contains_key(id) {
                let wants_shell = !command.pending_input.is_empty()
                    || (command.auto_start && !command.auto_started);
                if !wants_shell {
                    continue;
                }
                links.insert(id, ShellLink::new(*epoch));
            }
            let Some(link) = links.get_mut(id) else {
                continue;
            };

            if let Err(err) = drive_link(id, command, link, executor, *epoch, frame) {
                fail(id, command, link, err, frame);
            }
        }
    }
}

fn set_status(id: MachineId, command: &mut CommandMachine, status: CommandStatus, frame: &mut BridgeFrame<'_>) {
    if command.status == status {
        return;
    }
    command.status = status;
    frame.events.emit(Event::CommandStatusChanged {
        machine: id,
        status,
        tick: frame.tick,
    });
}

/// Log the failure, drop the session and schedule a reopen.
fn fail(
    id: MachineId,
    command: &mut CommandMachine,
    link: &mut ShellLink,
    err: ShellError,
    frame: &mut BridgeFrame<'_>,
) {
    log::warn!("command machine {id:?} (`{}`): {err}", command.command);
    link.stop();
    let retry = f64_to_fixed64(frame.config.command_retry_ms.max(0.0));
    link.session = SessionState::Idle {
        retry_at: Some(frame.now + retry),
    };
    command.processing = false;
    command.stream_started = false;
    command.run_started_at = None;
    set_status(id, command, CommandStatus::Error, frame);
}

fn drive_link(
    id: MachineId,
    command: &mut CommandMachine,
    link: &mut ShellLink,
    executor: &mut Option<Box<dyn ShellExecutor>>,
    epoch: u64,
    frame: &mut BridgeFrame<'_>,
) -> Result<(), ShellError> {
    if let SessionState::Idle { retry_at } = &link.session {
        if retry_at.is_some_and(|at| frame.now < at) {
            return Ok(());
        }
        let executor = executor.as_mut().ok_or(ShellError::Unavailable)?;
        log::debug!("opening shell for command machine {id:?} in {}", command.cwd);
        link.session = SessionState::Pending(executor.open(&command.cwd));
        set_status(id, command, CommandStatus::Starting, frame);
    }

    if let SessionState::Pending(pending) = &mut link.session {
        match pending.poll() {
            Poll::Pending => return Ok(()),
            Poll::Ready(result) => {
                link.session = SessionState::Ready(result?);
                set_status(id, command, CommandStatus::Ready, frame);
            }
        }
    }

    let SessionState::Ready(session) = &mut link.session else {
        return Ok(());
    };

    match command.mode {
        CommandMode::Stream => {
            if !command.stream_started && !command.pending_input.is_empty() {
                session.write(&format!("stdbuf -o0 {}\n", command.command))?;
                command.stream_started = true;
                set_status(id, command, CommandStatus::Running, frame);
            }
            if command.stream_started && !command.pending_input.is_empty() {
                session.write(&command.pending_input)?;
                command.pending_input.clear();
            }
        }
        CommandMode::Line | CommandMode::Args => {
            if link.run.is_none() {
                let line = if command.auto_start && !command.auto_started {
                    command.auto_started = true;
                    Some(None)
                } else {
                    command.take_line().map(Some)
                };
                if let Some(line) = line {
                    link.seq += 1;
                    let run = MarkerRun::new(epoch, link.seq);
                    let input = match (&line, command.mode) {
                        (None, _) => RunInput::None,
                        (Some(line), CommandMode::Args) => RunInput::Args(line),
                        (Some(line), _) => RunInput::Stdin(line),
                    };
                    session.write(&run.script(&command.command, input))?;
                    link.run = Some(run);
                    command.processing = true;
                    command.run_started_at = Some(frame.now);
                    set_status(id, command, CommandStatus::Running, frame);
                }
            }
        }
    }

    let stdout = link.stdout.get_or_insert_with(|| session.read_stdout());
    if let Poll::Ready(result) = stdout.poll() {
        link.stdout = None;
        let chunk = result?;
        match command.mode {
            CommandMode::Stream => command.output.extend(chunk.chars()),
            CommandMode::Line | CommandMode::Args => {
                if let Some(out) = link.run.as_mut().and_then(|run| run.feed(&chunk)) {
                    link.run = None;
                    complete(id, command, out, frame);
                }
            }
        }
    }

    let stderr = link.stderr.get_or_insert_with(|| session.read_stderr());
    if let Poll::Ready(result) = stderr.poll() {
        link.stderr = None;
        let text = result?;
        log::debug!("command machine {id:?} stderr: {}", text.trim_end());
        frame.events.emit(Event::CommandStderr {
            machine: id,
            text,
            tick: frame.tick,
        });
    }

    Ok(())
}

/// A line/args run finished: its output becomes emittable.
fn complete(id: MachineId, command: &mut CommandMachine, out: String, frame: &mut BridgeFrame<'_>) {
    let duration_ms = command
        .run_started_at
        .take()
        .map_or(Millis::ZERO, |started| frame.now - started);
    command.output.extend(out.chars());
    command.processing = false;
    frame.events.emit(Event::CommandCompleted {
        machine: id,
        bytes: out.len(),
        duration_ms,
        tick: frame.tick,
    });
    set_status(id, command, CommandStatus::Ready, frame);
}
