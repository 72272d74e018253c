//! GDB debug session
//!
//! Ties the transport, readers, dispatcher and router together and exposes
//! one blocking call per debugger operation.

use crate::gdb::config::{GdbConfig, SessionSetup};
use crate::gdb::dispatcher::{lock, CommandDispatcher, SessionShared};
use crate::gdb::error::{GdbError, Result};
use crate::gdb::reader::{OutputReader, StreamKind};
use crate::gdb::router::{Collaborators, EventRouter};
use crate::gdb::transport::{ProcessTransport, Streams, Transport};
use crate::gdb::types::*;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Span};
use uuid::Uuid;

pub struct GdbSession {
    id: Uuid,
    span: Span,
    config: GdbConfig,
    setup: Arc<dyn SessionSetup>,
    shared: Arc<SessionShared>,
    router: EventRouter,
    dispatcher: Mutex<Option<Arc<CommandDispatcher>>>,
}

impl GdbSession {
    pub fn new(config: GdbConfig, setup: Arc<dyn SessionSetup>, collaborators: Collaborators) -> Self {
        let id = Uuid::new_v4();
        let span = info_span!("gdb_session", id = %id);
        Self {
            id,
            span,
            config,
            setup,
            shared: Arc::new(SessionShared::new()),
            router: EventRouter::new(collaborators),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether the target is executing
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.router.subscribe()
    }

    /// Breakpoint the target last stopped at
    pub fn current_breakpoint(&self) -> Option<Breakpoint> {
        self.router.current_breakpoint()
    }

    /// Launch GDB and run the warm-up sequence
    pub fn start(&self) -> Result<()> {
        if !self.shared.begin_start() {
            return Err(GdbError::AlreadyStarted);
        }
        let _entered = self.span.enter();

        let (transport, streams) = match ProcessTransport::spawn(&self.config, self.setup.as_ref()) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to start GDB: {}", e);
                self.shared.mark_exited();
                return Err(e);
            }
        };
        info!("GDB process {} started", transport.pid());
        self.launch(Arc::new(transport), streams)
    }

    /// Start over an already connected transport
    pub fn start_with_transport(&self, transport: Arc<dyn Transport>, streams: Streams) -> Result<()> {
        if !self.shared.begin_start() {
            return Err(GdbError::AlreadyStarted);
        }
        let _entered = self.span.enter();
        self.launch(transport, streams)
    }

    fn launch(&self, transport: Arc<dyn Transport>, streams: Streams) -> Result<()> {
        let events = self.router.sender();
        OutputReader::new(Arc::clone(&self.shared), events.clone()).spawn(
            streams.stdout,
            StreamKind::Stdout,
            self.span.clone(),
        );
        OutputReader::new(Arc::clone(&self.shared), events.clone()).spawn(
            streams.stderr,
            StreamKind::Stderr,
            self.span.clone(),
        );

        let shared = Arc::clone(&self.shared);
        let exit_events = events.clone();
        transport.on_exit(Box::new(move || {
            if shared.mark_exited() {
                exit_events.publish(SessionEvent::Exited);
            }
        }));

        let dispatcher = Arc::new(CommandDispatcher::new(
            transport,
            Arc::clone(&self.shared),
            events,
            &self.config,
        ));
        *lock(&self.dispatcher) = Some(Arc::clone(&dispatcher));

        if !self.shared.wait_client_ready(self.config.ready_timeout) {
            let err = if self.shared.is_exited() {
                GdbError::Exited
            } else {
                GdbError::ReadyTimeout(self.config.ready_timeout)
            };
            error!("GDB did not come up: {}", err);
            self.stop();
            return Err(err);
        }

        for command in self.warmup_commands() {
            let result = dispatcher.execute(&command, &[]);
            if is_warmup_failure(&result) {
                error!("Warm-up command `{}` failed: {}", command, result.raw);
                self.stop();
                return Err(GdbError::Warmup {
                    command,
                    status: result.status,
                });
            }
        }

        if !self.shared.finish_start() {
            debug!("Target state after warm-up: {}", self.shared.state());
        }
        info!("GDB session ready");
        Ok(())
    }

    fn warmup_commands(&self) -> Vec<String> {
        let mut commands = vec!["-enable-pretty-printing".to_string()];
        if self.config.async_mode {
            commands.push("-gdb-set mi-async on".to_string());
        }
        commands.push("-gdb-set pagination off".to_string());
        if let Some(arch) = &self.config.architecture {
            commands.push(format!("-gdb-set architecture {}", arch));
        }
        commands.extend(self.setup.setup_commands(&self.config));
        commands
    }

    /// Quit GDB and release the process. Safe to call more than once.
    pub fn stop(&self) {
        let _entered = self.span.enter();
        let dispatcher = lock(&self.dispatcher).take();

        if let Some(dispatcher) = dispatcher {
            info!("Stopping GDB session");
            if self.shared.is_running() {
                let paused = dispatcher.pause();
                debug!("Pause before quit: {}", paused.status);
            }

            match dispatcher.try_run_command("-gdb-exit", &[], self.config.quit_timeout) {
                Some(result) => debug!("-gdb-exit: {}", result.status),
                None => warn!("GDB busy, terminating without -gdb-exit"),
            }

            dispatcher.transport().close_input();
            dispatcher.transport().terminate();
        }

        if self.shared.mark_exited() {
            self.router.publish(SessionEvent::Exited);
        }
    }

    fn dispatcher(&self) -> Option<Arc<CommandDispatcher>> {
        lock(&self.dispatcher).clone()
    }

    fn not_started(&self) -> CommandResult {
        if self.shared.is_exited() {
            CommandResult::exited()
        } else {
            CommandResult::synthesized(CommandStatus::Error, "GDB session is not started")
        }
    }

    fn execute(&self, command: &str, args: &[&str]) -> CommandResult {
        let Some(dispatcher) = self.dispatcher() else {
            return self.not_started();
        };
        let _entered = self.span.enter();
        dispatcher.execute(command, args)
    }

    /// Send a raw command line and wait up to `timeout` for its result
    pub fn run_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let Some(dispatcher) = self.dispatcher() else {
            return self.not_started();
        };
        let _entered = self.span.enter();
        dispatcher.run_command(command, &[], timeout)
    }

    pub fn run(&self) -> CommandResult {
        self.execute("-exec-run", &[])
    }

    /// Step into
    pub fn step(&self) -> CommandResult {
        self.execute("-exec-step", &[])
    }

    /// Step over
    pub fn next(&self) -> CommandResult {
        self.execute("-exec-next", &[])
    }

    /// Step out
    pub fn finish(&self) -> CommandResult {
        self.execute("-exec-finish", &[])
    }

    pub fn continue_execution(&self) -> CommandResult {
        self.execute("-exec-continue", &[])
    }

    pub fn pause(&self) -> CommandResult {
        let Some(dispatcher) = self.dispatcher() else {
            return self.not_started();
        };
        let _entered = self.span.enter();
        dispatcher.pause()
    }

    pub fn print(&self, symbol: &str) -> CommandResult {
        self.execute("print", &[symbol])
    }

    pub fn insert_breakpoint(&self, breakpoint: &Breakpoint) -> CommandResult {
        self.execute("-break-insert", &[&breakpoint.location_arg()])
    }

    pub fn remove_breakpoint(&self, breakpoint: &Breakpoint) -> CommandResult {
        self.execute("clear", &[&breakpoint.location_arg()])
    }

    pub fn evaluate_expression(&self, expression: &str) -> CommandResult {
        self.execute("-data-evaluate-expression", &[expression])
    }

    /// Run each setting as a command, stopping at the first failure
    pub fn set_settings<S: AsRef<str>>(&self, settings: &[S]) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(settings.len());
        for setting in settings {
            let result = self.execute(setting.as_ref(), &[]);
            let failed = !result.is_success();
            results.push(result);
            if failed {
                warn!("Setting `{}` failed", setting.as_ref());
                break;
            }
        }
        results
    }

    pub fn stack_list_frames(&self) -> CommandResult {
        self.execute("-stack-list-frames", &[])
    }

    /// Locals of the selected frame with their values
    pub fn stack_list_locals(&self) -> CommandResult {
        self.execute("-stack-list-locals", &["1"])
    }
}

fn is_warmup_failure(result: &CommandResult) -> bool {
    matches!(
        result.status,
        CommandStatus::Error
            | CommandStatus::Timeout
            | CommandStatus::Exit
            | CommandStatus::Running
    )
}

impl Drop for GdbSession {
    fn drop(&mut self) {
        self.stop();
    }
}
