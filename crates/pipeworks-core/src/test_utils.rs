//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::sync::{Arc, Mutex, MutexGuard};

use crate::direction::Direction;
use crate::engine::Simulation;
use crate::fixed::Fixed64;
use crate::id::MachineId;
use crate::machine::MachineKind;
use crate::shell::{PendingRead, PendingSession, Resolver, ShellError, ShellExecutor, ShellSession};

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Layout builders
// ===========================================================================

/// A row of right-facing belts from `x0` to `x1` inclusive on row `y`.
pub fn belt_row(sim: &mut Simulation, x0: i32, x1: i32, y: i32) {
    for x in x0..=x1 {
        sim.set_belt(x, y, Direction::Right).unwrap();
    }
}

/// `[source] -> belts -> [sink]` along row 0 of a fresh, started simulation.
/// Returns the simulation with the source and sink ids.
pub fn source_to_sink(source: MachineKind, belts: i32) -> (Simulation, MachineId, MachineId) {
    let mut sim = Simulation::new(belts as u32 + 2, 1);
    let src = sim.place_machine(0, 0, Direction::Right, source).unwrap();
    belt_row(&mut sim, 1, belts, 0);
    let sink = sim
        .place_machine(belts + 1, 0, Direction::Right, MachineKind::sink())
        .unwrap();
    sim.start();
    (sim, src, sink)
}

/// Run `frames` updates of 16 ms.
pub fn run(sim: &mut Simulation, frames: usize) {
    sim.run_frames(frames, 16.0);
}

/// What the sink has received so far, joined.
pub fn sink_text(sim: &Simulation, sink: MachineId) -> String {
    sim.machine(sink)
        .and_then(|m| m.sink_contents())
        .unwrap_or_default()
        .concat()
}

// ===========================================================================
// Scripted shell
// ===========================================================================

#[derive(Debug, Default)]
struct ShellLog {
    opened: usize,
    failures_left: usize,
    stopped: usize,
    writes: Vec<String>,
}

/// An in-memory [`ShellExecutor`] that understands the handful of script
/// forms the command bridge writes and a few coreutils-like commands:
/// `cat`, `rev`, `tr a-z A-Z`, `wc -c`, `echo` and `true`. Anything else
/// writes "not found" to stderr.
///
/// Sessions resolve reads synchronously, so a full run completes within one
/// update. Clones share their bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ScriptedShell {
    log: Arc<Mutex<ShellLog>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` opens fail with a spawn error.
    pub fn failing_opens(n: usize) -> Self {
        let shell = Self::default();
        shell.lock().failures_left = n;
        shell
    }

    fn lock(&self) -> MutexGuard<'_, ShellLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sessions requested so far, including failed ones.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Sessions stopped by the bridge.
    pub fn stopped(&self) -> usize {
        self.lock().stopped
    }

    /// Everything written to any session, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }
}

impl ShellExecutor for ScriptedShell {
    fn open(&mut self, cwd: &str) -> PendingSession {
        let mut log = self.lock();
        log.opened += 1;
        if log.failures_left > 0 {
            log.failures_left -= 1;
            return PendingSession::ready(Err(ShellError::Spawn {
                cwd: cwd.to_string(),
                reason: "scripted failure".into(),
            }));
        }
        let session: Box<dyn ShellSession> = Box::new(ScriptedSession::new(self.log.clone()));
        PendingSession::ready(Ok(session))
    }
}

#[derive(Default)]
struct Stream {
    buffer: String,
    waiter: Option<Resolver<String>>,
}

impl Stream {
    fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
        if self.buffer.is_empty() {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            waiter.resolve(Ok(std::mem::take(&mut self.buffer)));
        }
    }

    fn read(&mut self, stopped: bool) -> PendingRead {
        if !self.buffer.is_empty() {
            return PendingRead::ready(Ok(std::mem::take(&mut self.buffer)));
        }
        if stopped {
            return PendingRead::ready(Err(ShellError::Closed));
        }
        let (resolver, pending) = PendingRead::channel();
        self.waiter = Some(resolver);
        pending
    }
}

/// One scripted shell session.
pub struct ScriptedSession {
    log: Arc<Mutex<ShellLog>>,
    stdout: Stream,
    stderr: Stream,
    /// Set once `stdbuf -o0 CMD` has been issued; later input feeds `CMD`.
    streaming: Option<String>,
    stopped: bool,
}

impl ScriptedSession {
    fn new(log: Arc<Mutex<ShellLog>>) -> Self {
        Self {
            log,
            stdout: Stream::default(),
            stderr: Stream::default(),
            streaming: None,
            stopped: false,
        }
    }

    fn run_line(&mut self, line: &str) {
        if let Some(command) = line.strip_prefix("stdbuf -o0 ") {
            self.streaming = Some(command.to_string());
            return;
        }
        // printf '%s\n' 'INPUT' | { CMD; }
        if let Some(rest) = line.strip_prefix("printf '%s\\n' ") {
            let Some((text, rest)) = unquote(rest) else {
                return;
            };
            if let Some(command) = rest
                .strip_prefix(" | { ")
                .and_then(|r| r.strip_suffix("; }"))
            {
                self.exec(command, &format!("{text}\n"), None);
            } else {
                self.stdout.push(&format!("{text}\n"));
            }
            return;
        }
        // { CMD; } </dev/null
        if let Some(command) = line
            .strip_prefix("{ ")
            .and_then(|r| r.strip_suffix("; } </dev/null"))
        {
            self.exec(command, "", None);
            return;
        }
        // CMD 'ARG' </dev/null
        if let Some(body) = line.strip_suffix(" </dev/null") {
            if let Some(start) = body.find(" '") {
                if let Some((arg, "")) = unquote(&body[start + 1..]) {
                    self.exec(&body[..start], "", Some(&arg));
                    return;
                }
            }
            self.exec(body, "", None);
            return;
        }
        self.exec(line, "", None);
    }

    fn exec(&mut self, command: &str, stdin: &str, arg: Option<&str>) {
        let (output, error) = interpret(command, stdin, arg);
        self.stdout.push(&output);
        self.stderr.push(&error);
    }
}

impl ShellSession for ScriptedSession {
    fn write(&mut self, input: &str) -> Result<(), ShellError> {
        if self.stopped {
            return Err(ShellError::Write("session stopped".into()));
        }
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .writes
            .push(input.to_string());

        let mut rest = input;
        while self.streaming.is_none() {
            let Some(end) = rest.find('\n') else {
                return Ok(());
            };
            self.run_line(&rest[..end]);
            rest = &rest[end + 1..];
        }
        if !rest.is_empty() {
            self.write_stream(rest);
        }
        Ok(())
    }

    fn read_stdout(&mut self) -> PendingRead {
        self.stdout.read(self.stopped)
    }

    fn read_stderr(&mut self) -> PendingRead {
        self.stderr.read(self.stopped)
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.log
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .stopped += 1;
        }
    }
}

impl ScriptedSession {
    /// Input after `stdbuf -o0 CMD` goes straight to `CMD`.
    fn write_stream(&mut self, input: &str) {
        if let Some(command) = self.streaming.clone() {
            self.exec(&command, input, None);
        }
    }
}

/// Parse one single-quoted word as written by `shell_quote`, returning it and
/// whatever follows.
fn unquote(s: &str) -> Option<(String, &str)> {
    let mut rest = s.strip_prefix('\'')?;
    let mut word = String::new();
    loop {
        let end = rest.find('\'')?;
        word.push_str(&rest[..end]);
        rest = &rest[end + 1..];
        match rest.strip_prefix("\\''") {
            Some(after) => {
                word.push('\'');
                rest = after;
            }
            None => return Some((word, rest)),
        }
    }
}

/// Run a scripted command. Returns `(stdout, stderr)`.
fn interpret(command: &str, stdin: &str, arg: Option<&str>) -> (String, String) {
    let mut words = command.split_whitespace();
    let program = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    match (program, rest.as_slice()) {
        ("cat", []) => (stdin.to_string(), String::new()),
        ("rev", []) => {
            let mut out = String::new();
            for line in stdin.split_inclusive('\n') {
                let (body, newline) = match line.strip_suffix('\n') {
                    Some(body) => (body, "\n"),
                    None => (line, ""),
                };
                out.extend(body.chars().rev());
                out.push_str(newline);
            }
            (out, String::new())
        }
        ("tr", ["a-z", "A-Z"]) => (stdin.to_ascii_uppercase(), String::new()),
        ("wc", ["-c"]) => (format!("{}\n", stdin.len()), String::new()),
        ("echo", words) => {
            let mut parts: Vec<&str> = words.to_vec();
            if let Some(arg) = arg {
                parts.push(arg);
            }
            (format!("{}\n", parts.join(" ")), String::new())
        }
        ("true", []) => (String::new(), String::new()),
        _ => (String::new(), format!("sh: {program}: not found\n")),
    }
}
