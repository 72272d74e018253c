//! Command dispatch and result correlation
//!
//! GDB/MI results carry no correlation unless tokens are used, so exactly
//! one command may be in flight: the next `^` record belongs to it. Each
//! command arms the result slot with a fresh generation; a result that
//! arrives while nothing is armed is a late answer to a command that
//! already timed out and is dropped.

use crate::gdb::config::GdbConfig;
use crate::gdb::router::EventSender;
use crate::gdb::transport::Transport;
use crate::gdb::types::*;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admits one command at a time across all callers
#[derive(Default)]
pub struct CommandGate {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl CommandGate {
    pub fn acquire(&self) -> CommandPermit<'_> {
        let mut busy = lock(&self.busy);
        while *busy {
            busy = self.cond.wait(busy).unwrap_or_else(PoisonError::into_inner);
        }
        *busy = true;
        CommandPermit { gate: self }
    }

    /// Give up after `timeout` instead of queueing behind a stuck command
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<CommandPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut busy = lock(&self.busy);
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            busy = self
                .cond
                .wait_timeout(busy, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *busy = true;
        Some(CommandPermit { gate: self })
    }
}

/// Held for the lifetime of one command
pub struct CommandPermit<'a> {
    gate: &'a CommandGate,
}

impl Drop for CommandPermit<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.busy) = false;
        self.gate.cond.notify_one();
    }
}

#[derive(Debug, Default)]
struct ResultSlot {
    generation: u64,
    armed: Option<u64>,
    last: Option<CommandResult>,
    exited: bool,
}

#[derive(Debug)]
struct ExecState {
    running: bool,
    client_ready: bool,
    state: SessionState,
}

/// State shared between callers, the reader threads and the session.
///
/// The result slot is always locked before the exec state when both are
/// held.
pub struct SessionShared {
    gate: CommandGate,
    results: Mutex<ResultSlot>,
    results_cond: Condvar,
    exec: Mutex<ExecState>,
    exec_cond: Condvar,
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            gate: CommandGate::default(),
            results: Mutex::new(ResultSlot::default()),
            results_cond: Condvar::new(),
            exec: Mutex::new(ExecState {
                running: false,
                client_ready: false,
                state: SessionState::Idle,
            }),
            exec_cond: Condvar::new(),
        }
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub fn state(&self) -> SessionState {
        lock(&self.exec).state
    }

    /// Move from `Idle` to `Starting`; a session starts only once
    pub fn begin_start(&self) -> bool {
        let mut exec = lock(&self.exec);
        if exec.state != SessionState::Idle {
            return false;
        }
        exec.state = SessionState::Starting;
        true
    }

    /// Move from `Starting` to `Ready` once warm-up is done.
    ///
    /// A state set by an exec event during warm-up, such as `Stopped` after
    /// connecting to a remote target, is kept.
    pub fn finish_start(&self) -> bool {
        let mut exec = lock(&self.exec);
        if exec.state != SessionState::Starting {
            return false;
        }
        exec.state = SessionState::Ready;
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.exec).running
    }

    pub fn set_running(&self, running: bool) {
        lock(&self.exec).running = running;
        self.exec_cond.notify_all();
    }

    /// Apply an exec event: `*running` marks the target running, anything
    /// else stops it
    pub fn apply_exec_event(&self, event: &GdbEvent) {
        let running = event.name == "running";
        let mut exec = lock(&self.exec);
        exec.running = running;
        if exec.state != SessionState::Exited {
            exec.state = if running {
                SessionState::Running
            } else {
                SessionState::Stopped
            };
        }
        drop(exec);
        self.exec_cond.notify_all();
    }

    pub fn mark_client_ready(&self) {
        let mut exec = lock(&self.exec);
        if !exec.client_ready {
            exec.client_ready = true;
            drop(exec);
            self.exec_cond.notify_all();
        }
    }

    /// Wait until GDB printed its first line or the session ended
    pub fn wait_client_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exec = lock(&self.exec);
        while !exec.client_ready && exec.state != SessionState::Exited {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            exec = self
                .exec_cond
                .wait_timeout(exec, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        exec.client_ready
    }

    pub fn is_exited(&self) -> bool {
        lock(&self.results).exited
    }

    /// Record a `^` result.
    ///
    /// The running flag follows every result, including stale ones, since
    /// it reflects what GDB is actually doing.
    pub fn deliver_result(&self, result: CommandResult) {
        {
            let mut exec = lock(&self.exec);
            exec.running = result.status == CommandStatus::Running;
        }
        self.exec_cond.notify_all();

        let mut slot = lock(&self.results);
        if slot.armed.is_none() {
            warn!("Discarding result with no command waiting: {}", result.raw);
            return;
        }
        slot.last = Some(result);
        drop(slot);
        self.results_cond.notify_all();
    }

    /// Enter the terminal state and wake every waiter.
    ///
    /// Returns `false` when the session had already exited.
    pub fn mark_exited(&self) -> bool {
        let mut slot = lock(&self.results);
        if slot.exited {
            return false;
        }
        slot.exited = true;
        {
            let mut exec = lock(&self.exec);
            exec.running = false;
            exec.state = SessionState::Exited;
        }
        drop(slot);
        self.results_cond.notify_all();
        self.exec_cond.notify_all();
        true
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a command and its arguments into the line written to GDB
pub fn format_command(command: &str, args: &[&str]) -> String {
    std::iter::once(command)
        .chain(args.iter().copied())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Issues commands over a transport and waits for their results
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    events: EventSender,
    async_mode: bool,
    command_timeout: Duration,
    pause_attempts: u32,
    pause_interval: Duration,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        shared: Arc<SessionShared>,
        events: EventSender,
        config: &GdbConfig,
    ) -> Self {
        Self {
            transport,
            shared,
            events,
            async_mode: config.async_mode,
            command_timeout: config.command_timeout,
            pause_attempts: config.pause_attempts,
            pause_interval: config.pause_interval,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run a command with the configured timeout
    pub fn execute(&self, command: &str, args: &[&str]) -> CommandResult {
        self.run_command(command, args, self.command_timeout)
    }

    /// Send one command and block until its result, session exit or timeout
    pub fn run_command(&self, command: &str, args: &[&str], timeout: Duration) -> CommandResult {
        let _permit = self.shared.gate().acquire();
        self.run_admitted(command, args, timeout)
    }

    /// Like `run_command`, but gives up if the gate is not free within
    /// `timeout`
    pub fn try_run_command(
        &self,
        command: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Option<CommandResult> {
        let _permit = self.shared.gate().try_acquire_for(timeout)?;
        Some(self.run_admitted(command, args, timeout))
    }

    fn run_admitted(&self, command: &str, args: &[&str], timeout: Duration) -> CommandResult {
        if self.shared.is_exited() {
            return CommandResult::exited();
        }

        let line = format_command(command, args);

        if !self.async_mode {
            let mut exec = lock(&self.shared.exec);
            if exec.running {
                drop(exec);
                let rejection = CommandResult::target_running();
                info!("Rejected `{}`: {}", line, rejection.raw);
                self.events
                    .publish(SessionEvent::Output(format!("{}: {}", rejection.raw, line)));
                return rejection;
            }
            exec.running = true;
        }

        let generation = {
            let mut slot = lock(&self.shared.results);
            slot.generation += 1;
            slot.armed = Some(slot.generation);
            slot.last = None;
            slot.generation
        };

        debug!("Sending command: {}", line);
        if let Err(e) = self.transport.write_line(&line) {
            error!("Failed to send `{}`: {}", line, e);
            self.disarm();
            if self.shared.is_exited() {
                return CommandResult::exited();
            }
            return CommandResult::synthesized(
                CommandStatus::Error,
                &format!("Failed to send command to GDB: {}", e),
            );
        }
        self.events.publish(SessionEvent::CommandSent(line.clone()));

        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.shared.results);
        loop {
            if slot.armed == Some(generation) {
                if let Some(result) = slot.last.take() {
                    slot.armed = None;
                    debug!("Result for `{}`: {}", line, result.status);
                    return result;
                }
            }
            if slot.exited {
                slot.armed = None;
                return CommandResult::exited();
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slot = self
                .shared
                .results_cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        slot.armed = None;
        if !self.async_mode {
            lock(&self.shared.exec).running = false;
        }
        drop(slot);

        info!("GDB timed out after {:?} waiting for `{}`", timeout, line);
        CommandResult::timeout()
    }

    fn disarm(&self) {
        lock(&self.shared.results).armed = None;
        if !self.async_mode {
            self.shared.set_running(false);
        }
    }

    /// Stop the target.
    ///
    /// Async mode asks GDB with `-exec-interrupt`. Sync mode signals the
    /// process and waits for the target to report it stopped, retrying a
    /// few times.
    pub fn pause(&self) -> CommandResult {
        if self.async_mode {
            return self.execute("-exec-interrupt", &[]);
        }
        if self.shared.is_exited() {
            return CommandResult::exited();
        }

        let mut exec = lock(&self.shared.exec);
        if !exec.running {
            return CommandResult::synthesized(CommandStatus::Done, "Target is not running");
        }

        for attempt in 1..=self.pause_attempts {
            debug!("Interrupting target, attempt {}", attempt);
            if let Err(e) = self.transport.interrupt() {
                error!("Failed to interrupt GDB: {}", e);
                return CommandResult::synthesized(CommandStatus::Error, &e.to_string());
            }

            let deadline = Instant::now() + self.pause_interval;
            while exec.running && exec.state != SessionState::Exited {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                exec = self
                    .shared
                    .exec_cond
                    .wait_timeout(exec, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }

            if exec.state == SessionState::Exited {
                return CommandResult::exited();
            }
            if !exec.running {
                info!("Target paused after {} attempt(s)", attempt);
                return CommandResult::synthesized(CommandStatus::Done, "Target paused");
            }
        }

        warn!("Target still running after {} interrupts", self.pause_attempts);
        CommandResult::synthesized(CommandStatus::Error, "Failed to pause the target")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_format_command_single_spaces() {
        assert_eq!(format_command("-exec-run", &[]), "-exec-run");
        assert_eq!(
            format_command("-break-insert", &["\"/proj/a.vhd:7\""]),
            "-break-insert \"/proj/a.vhd:7\""
        );
        assert_eq!(format_command("print", &["", "x"]), "print x");
    }

    #[test]
    fn test_gate_admits_one_holder() {
        let gate = CommandGate::default();
        let permit = gate.acquire();
        assert!(gate.try_acquire_for(Duration::from_millis(20)).is_none());
        drop(permit);
        assert!(gate.try_acquire_for(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn test_gate_hands_over_to_waiter() {
        let gate = Arc::new(CommandGate::default());
        let permit = gate.acquire();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.try_acquire_for(Duration::from_secs(5)).is_some())
        };
        thread::sleep(Duration::from_millis(20));
        drop(permit);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_unarmed_result_is_discarded() {
        let shared = SessionShared::new();
        shared.deliver_result(CommandResult::new(CommandStatus::Done, "^done", None));
        assert!(lock(&shared.results).last.is_none());
        assert!(!shared.is_running());

        shared.deliver_result(CommandResult::new(CommandStatus::Running, "^running", None));
        assert!(shared.is_running());
    }

    #[test]
    fn test_exec_events_drive_state() {
        let shared = SessionShared::new();
        shared.apply_exec_event(&GdbEvent::new("running", MiValue::empty_tuple()));
        assert!(shared.is_running());
        assert_eq!(shared.state(), SessionState::Running);
        shared.apply_exec_event(&GdbEvent::new("stopped", MiValue::empty_tuple()));
        assert!(!shared.is_running());
        assert_eq!(shared.state(), SessionState::Stopped);
    }

    #[test]
    fn test_finish_start_keeps_state_from_warmup() {
        let shared = SessionShared::new();
        assert!(shared.begin_start());
        shared.apply_exec_event(&GdbEvent::new("stopped", MiValue::empty_tuple()));
        assert!(!shared.finish_start());
        assert_eq!(shared.state(), SessionState::Stopped);

        let fresh = SessionShared::new();
        assert!(fresh.begin_start());
        assert!(fresh.finish_start());
        assert_eq!(fresh.state(), SessionState::Ready);
    }

    #[test]
    fn test_exited_is_terminal() {
        let shared = SessionShared::new();
        assert!(shared.mark_exited());
        assert!(!shared.mark_exited());
        assert!(!shared.finish_start());
        shared.apply_exec_event(&GdbEvent::new("running", MiValue::empty_tuple()));
        assert_eq!(shared.state(), SessionState::Exited);
        assert!(!shared.wait_client_ready(Duration::from_millis(10)));
    }
}
