use crate::gdb::types::CommandStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Grammar violation in one MI line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at {position}: {}", self.marked())]
pub struct ParseError {
    pub message: String,
    /// Byte offset where parsing stopped
    pub position: usize,
    pub line: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: &str, position: usize) -> Self {
        Self {
            message: message.into(),
            position: position.min(line.len()),
            line: line.to_string(),
        }
    }

    /// The line with the failure point marked the way GDB front ends do: `abc[!]def`
    fn marked(&self) -> String {
        match self.line.get(..self.position) {
            Some(head) => format!("{}[!]{}", head, &self.line[self.position..]),
            None => format!("{}[!]", self.line),
        }
    }
}

#[derive(Debug, Error)]
pub enum GdbError {
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirectory(PathBuf),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("GDB produced no output within {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error("warm-up command `{command}` failed with status {status}")]
    Warmup {
        command: String,
        status: CommandStatus,
    },

    #[error("GDB session already started")]
    AlreadyStarted,

    #[error("GDB session has exited")]
    Exited,

    #[error("interrupting the target is not supported on this platform")]
    InterruptUnsupported,

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GdbError>;
