//! Bridge Handler Implementation
//!
//! Maps JSON-RPC methods onto a single `GdbSession`. Session calls block,
//! so they run on the blocking pool; session events and editor navigation
//! are pushed to the host as notifications.

use crate::bridge::protocol::*;
use crate::gdb::config::{GdbConfig, LocalTarget, RemoteTarget, SessionSetup};
use crate::gdb::dispatcher::lock;
use crate::gdb::error::Result as GdbResult;
use crate::gdb::router::{BreakpointLookup, Collaborators, Navigator};
use crate::gdb::session::GdbSession;
use crate::gdb::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tracing::{debug, info, warn};

/// Outgoing lines, written to stdout in order
pub type Outbound = UnboundedSender<String>;

fn send<T: Serialize>(outbound: &Outbound, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            // The writer is gone only when the bridge is shutting down
            let _ = outbound.send(line);
        }
        Err(e) => warn!("Failed to serialize outgoing message: {}", e),
    }
}

/// Asks the host editor to show a stop location
struct EditorNavigator {
    outbound: Outbound,
}

impl Navigator for EditorNavigator {
    fn open_and_jump_to_line(&self, path: &Path, line: u32) -> anyhow::Result<()> {
        send(&self.outbound, &Notification::navigate(path, line));
        Ok(())
    }
}

/// Breakpoints inserted through this bridge
#[derive(Default)]
struct BreakpointRegistry {
    breakpoints: Mutex<HashSet<Breakpoint>>,
}

impl BreakpointLookup for BreakpointRegistry {
    fn find(&self, file: &Path, line: u32) -> Option<Breakpoint> {
        lock(&self.breakpoints)
            .iter()
            .find(|bp| bp.matches(file, line))
            .cloned()
    }
}

/// JSON-RPC front end for one debug session at a time
pub struct BridgeServer {
    session: RwLock<Option<Arc<GdbSession>>>,
    breakpoints: Arc<BreakpointRegistry>,
    outbound: Outbound,
}

impl BridgeServer {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            session: RwLock::new(None),
            breakpoints: Arc::new(BreakpointRegistry::default()),
            outbound,
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            navigator: Arc::new(EditorNavigator {
                outbound: self.outbound.clone(),
            }),
            breakpoints: self.breakpoints.clone(),
        }
    }

    /// Handle one input line; returns the response line, if any
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                return serde_json::to_string(&JsonRpcErrorResponse::new(
                    None,
                    JsonRpcError::parse_error(),
                ))
                .ok();
            }
        };

        debug!("Handling method: {}", request.method);
        let outcome = self.dispatch(&request.method, request.params).await;

        // Requests without an id are notifications and get no response
        let id = request.id?;
        let line = match outcome {
            Ok(result) => serde_json::to_string(&JsonRpcResponse::new(id, result)),
            Err(error) => {
                debug!("{} failed: {}", request.method, error.message);
                serde_json::to_string(&JsonRpcErrorResponse::new(Some(id), error))
            }
        };
        line.ok()
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "session/start" => self.handle_start(parse_params(params)?).await,
            "session/stop" => self.handle_stop().await,
            "session/status" => self.handle_status().await,

            "exec/run" => self.call(GdbSession::run).await,
            "exec/continue" => self.call(GdbSession::continue_execution).await,
            "exec/next" => self.call(GdbSession::next).await,
            "exec/step" => self.call(GdbSession::step).await,
            "exec/finish" => self.call(GdbSession::finish).await,
            "exec/pause" => self.call(GdbSession::pause).await,

            "data/print" => {
                let SymbolParams { symbol } = parse_params(params)?;
                self.call(move |s| s.print(&symbol)).await
            }
            "data/evaluate" => {
                let ExpressionParams { expression } = parse_params(params)?;
                self.call(move |s| s.evaluate_expression(&expression)).await
            }

            "break/insert" => self.handle_break_insert(parse_params(params)?).await,
            "break/remove" => self.handle_break_remove(parse_params(params)?).await,

            "gdb/settings" => {
                let SettingsParams { settings } = parse_params(params)?;
                self.call(move |s| s.set_settings(settings.as_slice())).await
            }
            "gdb/command" => {
                let CommandParams { command, timeout_ms } = parse_params(params)?;
                self.call(move |s| {
                    let timeout = timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(s.config().command_timeout);
                    s.run_command(&command, timeout)
                })
                .await
            }

            "stack/frames" => {
                self.call(|s| {
                    let result = s.stack_list_frames();
                    json!({ "frames": result.frames(), "result": result })
                })
                .await
            }
            "stack/locals" => {
                self.call(|s| {
                    let result = s.stack_list_locals();
                    json!({ "locals": result.locals(), "result": result })
                })
                .await
            }

            _ => {
                warn!("Unknown method: {}", method);
                Err(JsonRpcError::method_not_found(method))
            }
        }
    }

    async fn current_session(&self) -> Result<Arc<GdbSession>, JsonRpcError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(JsonRpcError::no_session)
    }

    /// Run a blocking session call off the async workers
    async fn call<T, F>(&self, f: F) -> Result<Value, JsonRpcError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&GdbSession) -> T + Send + 'static,
    {
        let session = self.current_session().await?;
        let output = tokio::task::spawn_blocking(move || f(&session))
            .await
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;
        serde_json::to_value(output).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    /// Push every event of `session` to the host until the session ends
    fn forward_events(&self, session: &GdbSession) {
        let events = session.subscribe();
        let outbound = self.outbound.clone();
        thread::spawn(move || {
            for event in events {
                send(&outbound, &Notification::session_event(&event));
            }
        });
    }

    /// Make an already started session the active one
    pub async fn attach(&self, session: Arc<GdbSession>) {
        self.forward_events(&session);
        *self.session.write().await = Some(session);
    }

    async fn handle_start(&self, params: StartParams) -> Result<Value, JsonRpcError> {
        if has_live_session(&*self.session.read().await) {
            return Err(already_running());
        }

        let mut config = GdbConfig::from_env(&params.elf_file);
        if let Some(gdb_path) = params.gdb_path {
            config.gdb_path = gdb_path;
        }
        if let Some(async_mode) = params.async_mode {
            config.async_mode = async_mode;
        }
        if let Some(ms) = params.command_timeout_ms {
            config.command_timeout = Duration::from_millis(ms);
        }
        config.architecture = params.architecture;

        let setup: Arc<dyn SessionSetup> = match params.remote {
            Some(remote) => Arc::new(RemoteTarget {
                remote,
                extended: params.extended_remote,
            }),
            None => Arc::new(LocalTarget),
        };

        info!("Starting GDB session for {}", params.elf_file.display());
        let session = Arc::new(GdbSession::new(config, setup, self.collaborators()));
        self.launch(session, GdbSession::start).await
    }

    /// Run `start` on the blocking pool, then make `session` the active one.
    ///
    /// The session slot is only locked to swap the session in, so status
    /// requests are answered while GDB comes up.
    async fn launch<F>(&self, session: Arc<GdbSession>, start: F) -> Result<Value, JsonRpcError>
    where
        F: FnOnce(&GdbSession) -> GdbResult<()> + Send + 'static,
    {
        self.forward_events(&session);

        let starting = Arc::clone(&session);
        let started = tokio::task::spawn_blocking(move || start(&starting))
            .await
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;
        if let Err(e) = started {
            return Err(JsonRpcError::start_failed(&e.to_string()));
        }

        let mut guard = self.session.write().await;
        if has_live_session(&guard) {
            drop(guard);
            warn!("Another session started first, stopping {}", session.id());
            let _ = tokio::task::spawn_blocking(move || session.stop()).await;
            return Err(already_running());
        }

        let status = json!({
            "session_id": session.id().to_string(),
            "state": session.state(),
        });
        *guard = Some(session);
        Ok(status)
    }

    async fn handle_stop(&self) -> Result<Value, JsonRpcError> {
        let session = self
            .session
            .write()
            .await
            .take()
            .ok_or_else(JsonRpcError::no_session)?;
        info!("Stopping GDB session {}", session.id());

        let state = tokio::task::spawn_blocking(move || {
            session.stop();
            session.state()
        })
        .await
        .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;
        Ok(json!({ "state": state }))
    }

    async fn handle_status(&self) -> Result<Value, JsonRpcError> {
        let guard = self.session.read().await;
        let Some(session) = guard.as_ref() else {
            return Ok(json!({ "state": SessionState::Idle }));
        };
        Ok(json!({
            "session_id": session.id().to_string(),
            "state": session.state(),
            "running": session.is_running(),
            "current_breakpoint": session.current_breakpoint(),
        }))
    }

    async fn handle_break_insert(&self, params: BreakpointParams) -> Result<Value, JsonRpcError> {
        let breakpoint = Breakpoint::from(params);
        let inserting = breakpoint.clone();
        let result = self.call(move |s| s.insert_breakpoint(&inserting)).await?;

        let result: CommandResult = serde_json::from_value(result)
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;
        if result.is_success() {
            lock(&self.breakpoints.breakpoints).insert(breakpoint);
        }
        Ok(json!({ "breakpoint": result.breakpoint_info(), "result": result }))
    }

    async fn handle_break_remove(&self, params: BreakpointParams) -> Result<Value, JsonRpcError> {
        let breakpoint = Breakpoint::from(params);
        let removing = breakpoint.clone();
        let result = self.call(move |s| s.remove_breakpoint(&removing)).await?;
        lock(&self.breakpoints.breakpoints).remove(&breakpoint);
        Ok(result)
    }
}

fn has_live_session(slot: &Option<Arc<GdbSession>>) -> bool {
    slot.as_ref().is_some_and(|s| s.state() != SessionState::Exited)
}

fn already_running() -> JsonRpcError {
    JsonRpcError::start_failed("GDB session already running. Use session/stop first.")
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}
