//! Completion markers: isolating one command's output on a shared stream.
//!
//! A shell session is one continuous stdout. To know where a single run ends,
//! the script for that run prints a unique sentinel line after the command.
//! [`MarkerRun::feed`] accumulates stdout and resolves exactly once, with the
//! text that preceded the sentinel.

/// What a run feeds to its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInput<'a> {
    /// No input; stdin is closed.
    None,
    /// One line piped to stdin.
    Stdin(&'a str),
    /// One line passed as a single argument.
    Args(&'a str),
}

/// Wrap `s` in single quotes for `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// One in-flight command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRun {
    sentinel: String,
    scanned: String,
    done: bool,
}

impl MarkerRun {
    /// `epoch` and `seq` make the sentinel unique across restarts and runs.
    pub fn new(epoch: u64, seq: u64) -> Self {
        Self {
            sentinel: format!("__PIPEWORKS_DONE_{epoch}_{seq}__"),
            scanned: String::new(),
            done: false,
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The text to write to the shell to run `command` once.
    pub fn script(&self, command: &str, input: RunInput<'_>) -> String {
        let run = match input {
            RunInput::None => format!("{{ {command}; }} </dev/null"),
            RunInput::Stdin(line) => {
                format!("printf '%s\\n' {} | {{ {command}; }}", shell_quote(line))
            }
            RunInput::Args(line) => format!("{command} {} </dev/null", shell_quote(line)),
        };
        format!("{run}\nprintf '%s\\n' {}\n", shell_quote(&self.sentinel))
    }

    /// Feed a chunk of stdout. Returns the run's output the first time the
    /// sentinel line has been seen, and `None` before and after that.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        if self.done {
            return None;
        }
        self.scanned.push_str(chunk);
        let marker = format!("{}\n", self.sentinel);
        let end = self.scanned.find(&marker)?;
        self.done = true;
        let mut output = std::mem::take(&mut self.scanned);
        output.truncate(end);
        Some(output)
    }
}
