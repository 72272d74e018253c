//! GDB process transport
//!
//! Owns the child process and its stdin. Output is handed back as line
//! sources so the reader threads can own them independently. A watcher
//! thread reports the process exit even when a debuggee that inherited
//! GDB's stdout keeps the pipe open.

use crate::gdb::config::{GdbConfig, SessionSetup};
use crate::gdb::dispatcher::lock;
use crate::gdb::error::{GdbError, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn, Span};

/// How often the watcher checks whether GDB is still alive
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines read from one output stream of the debugger
pub type LineSource = Box<dyn Iterator<Item = io::Result<String>> + Send>;

/// Called once when the debugger process is gone
pub type ExitListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ExitNoticeState {
    fired: bool,
    listener: Option<ExitListener>,
}

/// One-shot exit notification.
///
/// A listener registered after the exit runs immediately.
#[derive(Default)]
pub(crate) struct ExitNotice {
    state: Mutex<ExitNoticeState>,
}

impl ExitNotice {
    pub(crate) fn listen(&self, listener: ExitListener) {
        let mut state = lock(&self.state);
        if state.fired {
            drop(state);
            listener();
        } else {
            state.listener = Some(listener);
        }
    }

    /// Run the listener if this is the first exit; later calls do nothing
    pub(crate) fn fire(&self) {
        let listener = {
            let mut state = lock(&self.state);
            if state.fired {
                return;
            }
            state.fired = true;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener();
        }
    }
}

/// Output streams of a freshly started debugger
pub struct Streams {
    pub stdout: LineSource,
    pub stderr: LineSource,
}

/// Write side of a debugger connection.
///
/// Writes are not serialized here; the dispatcher guarantees a single
/// writer per command.
pub trait Transport: Send + Sync {
    /// Write one line followed by a newline and flush
    fn write_line(&self, line: &str) -> io::Result<()>;

    /// Deliver an interrupt to the debugger, stopping the target
    fn interrupt(&self) -> Result<()>;

    /// Close the debugger's stdin
    fn close_input(&self);

    /// Kill the debugger process
    fn terminate(&self);

    /// Register the one-shot listener for the debugger process exiting
    fn on_exit(&self, listener: ExitListener);
}

/// GDB running as a child process with piped stdio
pub struct ProcessTransport {
    stdin: Mutex<Option<ChildStdin>>,
    process: Arc<Mutex<Child>>,
    exit: Arc<ExitNotice>,
    pid: u32,
}

impl ProcessTransport {
    /// Start GDB in the directory of the program being debugged
    pub fn spawn(config: &GdbConfig, setup: &dyn SessionSetup) -> Result<(Self, Streams)> {
        let working_dir = config
            .working_dir()
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = working_dir {
            if !dir.is_dir() {
                return Err(GdbError::WorkingDirectory(dir.to_path_buf()));
            }
        }

        let args = setup.launch_args(config);
        info!("Starting GDB: {} {}", config.gdb_path, args.join(" "));

        let mut cmd = Command::new(&config.gdb_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut process = cmd.spawn().map_err(|source| GdbError::Launch {
            program: config.gdb_path.clone(),
            source,
        })?;

        let missing = |name: &str| io::Error::new(io::ErrorKind::BrokenPipe, format!("Failed to get {}", name));
        let stdin = process.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = process.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = process.stderr.take().ok_or_else(|| missing("stderr"))?;

        let pid = process.id();
        debug!("GDB started with pid {}", pid);

        let transport = Self {
            stdin: Mutex::new(Some(stdin)),
            process: Arc::new(Mutex::new(process)),
            exit: Arc::new(ExitNotice::default()),
            pid,
        };
        transport.watch_exit();
        let streams = Streams {
            stdout: Box::new(BufReader::new(stdout).lines()),
            stderr: Box::new(BufReader::new(stderr).lines()),
        };
        Ok((transport, streams))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Poll the child until it exits, then fire the exit notice.
    ///
    /// Polls instead of blocking in `wait` so `terminate` can still take
    /// the child to kill it.
    fn watch_exit(&self) {
        let process = Arc::clone(&self.process);
        let exit = Arc::clone(&self.exit);
        let pid = self.pid;
        let span = Span::current();
        thread::spawn(move || {
            let _entered = span.enter();
            loop {
                let status = lock(&process).try_wait();
                match status {
                    Ok(Some(status)) => {
                        info!("GDB process {} exited: {}", pid, status);
                        break;
                    }
                    Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                    Err(e) => {
                        warn!("Failed to poll GDB process {}: {}", pid, e);
                        break;
                    }
                }
            }
            exit.fire();
        });
    }
}

impl Transport for ProcessTransport {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdin = lock(&self.stdin);
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "GDB stdin is closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    #[cfg(unix)]
    fn interrupt(&self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGINT to GDB ({})", self.pid);
        kill(Pid::from_raw(self.pid as i32), Signal::SIGINT)
            .map_err(|errno| GdbError::Io(errno.into()))
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> Result<()> {
        Err(GdbError::InterruptUnsupported)
    }

    fn close_input(&self) {
        // Dropping stdin closes the pipe
        lock(&self.stdin).take();
    }

    fn terminate(&self) {
        let mut process = lock(&self.process);
        match process.try_wait() {
            Ok(Some(status)) => debug!("GDB already exited: {}", status),
            _ => {
                if let Err(e) = process.kill() {
                    warn!("Failed to kill GDB: {}", e);
                }
                let _ = process.wait();
            }
        }
    }

    fn on_exit(&self, listener: ExitListener) {
        self.exit.listen(listener);
    }
}
