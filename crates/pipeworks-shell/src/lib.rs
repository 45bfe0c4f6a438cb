//! Pipeworks Shell -- a [`ShellExecutor`] backed by real `sh` processes.
//!
//! Each session is one long-lived `sh` child with piped stdio. Writes go
//! through a writer thread and stdout/stderr are drained by reader threads,
//! so nothing on the simulation side ever blocks on the child.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use pipeworks_core::shell::{
    PendingRead, PendingSession, Resolver, ShellError, ShellExecutor, ShellSession,
};

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Spawns one shell process per session.
#[derive(Debug, Clone)]
pub struct ProcessShell {
    program: String,
}

impl Default for ProcessShell {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ProcessShell {
    /// Use `program` as the shell. It must read commands from stdin.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ShellExecutor for ProcessShell {
    fn open(&mut self, cwd: &str) -> PendingSession {
        let (resolver, pending) = PendingSession::channel();
        let program = self.program.clone();
        let cwd = cwd.to_string();
        thread::spawn(move || {
            let result = ProcessSession::spawn(&program, &cwd)
                .map(|session| Box::new(session) as Box<dyn ShellSession>);
            resolver.resolve(result);
        });
        pending
    }
}

// ---------------------------------------------------------------------------
// Output streams
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StreamState {
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
    waiter: Option<Resolver<String>>,
    closed: bool,
}

impl StreamState {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid bytes, not just a cut-off sequence.
            Err(_) => self.partial.len(),
        };
        let rest = self.partial.split_off(valid);
        let text = std::mem::replace(&mut self.partial, rest);
        self.buffer.push_str(&String::from_utf8_lossy(&text));
        self.wake();
    }

    fn close(&mut self) {
        if !self.partial.is_empty() {
            let tail = std::mem::take(&mut self.partial);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
            self.wake();
        }
        self.closed = true;
        if let Some(waiter) = self.waiter.take() {
            waiter.resolve(Err(ShellError::Closed));
        }
    }

    fn wake(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            waiter.resolve(Ok(std::mem::take(&mut self.buffer)));
        }
    }

    fn read(&mut self) -> PendingRead {
        if !self.buffer.is_empty() {
            return PendingRead::ready(Ok(std::mem::take(&mut self.buffer)));
        }
        if self.closed {
            return PendingRead::ready(Err(ShellError::Closed));
        }
        let (resolver, pending) = PendingRead::channel();
        self.waiter = Some(resolver);
        pending
    }
}

#[derive(Debug, Clone, Default)]
struct SharedStream(Arc<Mutex<StreamState>>);

impl SharedStream {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drain `source` on a background thread until EOF.
    fn pump(&self, name: &'static str, mut source: impl Read + Send + 'static) {
        let stream = self.clone();
        thread::spawn(move || {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => stream.lock().push_bytes(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("shell {name} read failed: {e}");
                        break;
                    }
                }
            }
            stream.lock().close();
        });
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One running shell process.
#[derive(Debug)]
pub struct ProcessSession {
    child: Child,
    input: Option<Sender<String>>,
    stdout: SharedStream,
    stderr: SharedStream,
}

impl ProcessSession {
    /// Start `program` in `cwd` with all three streams piped.
    pub fn spawn(program: &str, cwd: &str) -> Result<Self, ShellError> {
        let spawn_error = |reason: String| ShellError::Spawn {
            cwd: cwd.to_string(),
            reason,
        };
        let mut child = Command::new(program)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error("stdio was not piped".into()));
        };

        let session = Self {
            input: Some(writer(stdin)),
            stdout: SharedStream::default(),
            stderr: SharedStream::default(),
            child,
        };
        session.stdout.pump("stdout", stdout);
        session.stderr.pump("stderr", stderr);
        log::debug!("started {program} (pid {}) in {cwd}", session.child.id());
        Ok(session)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Forward queued input to the child's stdin until the sender is dropped.
fn writer(mut stdin: ChildStdin) -> Sender<String> {
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for input in rx {
            if let Err(e) = stdin.write_all(input.as_bytes()).and_then(|()| stdin.flush()) {
                log::debug!("shell stdin closed: {e}");
                break;
            }
        }
    });
    tx
}

impl ShellSession for ProcessSession {
    fn write(&mut self, input: &str) -> Result<(), ShellError> {
        let input_tx = self.input.as_ref().ok_or(ShellError::Closed)?;
        input_tx
            .send(input.to_string())
            .map_err(|_| ShellError::Write("stdin writer has exited".into()))
    }

    fn read_stdout(&mut self) -> PendingRead {
        self.stdout.lock().read()
    }

    fn read_stderr(&mut self) -> PendingRead {
        self.stderr.lock().read()
    }

    fn stop(&mut self) {
        if self.input.take().is_none() {
            return;
        }
        if let Err(e) = self.child.kill() {
            log::debug!("kill of pid {} failed: {e}", self.child.id());
        }
        let _ = self.child.wait();
        log::debug!("stopped shell pid {}", self.child.id());
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.stop();
    }
}
