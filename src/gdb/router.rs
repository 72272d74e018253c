//! Session event fan-out
//!
//! Events are queued to a dispatch thread so the reader never blocks on a
//! slow subscriber or on the editor. Every subscriber sees events in the
//! order they were read from GDB.

use crate::gdb::dispatcher::lock;
use crate::gdb::types::*;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info};

/// Opens source files in the host editor
pub trait Navigator: Send + Sync {
    fn open_and_jump_to_line(&self, path: &Path, line: u32) -> anyhow::Result<()>;

    /// Whether a stop location can be shown at all
    fn can_open(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Looks up breakpoints known to the host
pub trait BreakpointLookup: Send + Sync {
    fn find(&self, file: &Path, line: u32) -> Option<Breakpoint>;
}

/// Host for sessions without an editor
pub struct NoNavigation;

impl Navigator for NoNavigation {
    fn open_and_jump_to_line(&self, path: &Path, line: u32) -> anyhow::Result<()> {
        debug!("No navigator, ignoring {}:{}", path.display(), line);
        Ok(())
    }
}

/// Host without a breakpoint model
pub struct NoBreakpoints;

impl BreakpointLookup for NoBreakpoints {
    fn find(&self, _file: &Path, _line: u32) -> Option<Breakpoint> {
        None
    }
}

/// Collaborators injected by the host
#[derive(Clone)]
pub struct Collaborators {
    pub navigator: Arc<dyn Navigator>,
    pub breakpoints: Arc<dyn BreakpointLookup>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            navigator: Arc::new(NoNavigation),
            breakpoints: Arc::new(NoBreakpoints),
        }
    }
}

/// Cloneable handle for posting events to the router
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
}

impl EventSender {
    pub fn publish(&self, event: SessionEvent) {
        // Fails only once the router is gone, when nobody is listening
        let _ = self.tx.send(event);
    }
}

type Subscribers = Arc<Mutex<Vec<Sender<SessionEvent>>>>;

pub struct EventRouter {
    sender: EventSender,
    subscribers: Subscribers,
    current_breakpoint: Arc<Mutex<Option<Breakpoint>>>,
}

impl EventRouter {
    /// Start the dispatch thread; it ends when every sender is dropped
    pub fn new(collaborators: Collaborators) -> Self {
        let (tx, rx) = mpsc::channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let current_breakpoint = Arc::new(Mutex::new(None));

        let dispatch = Dispatch {
            subscribers: Arc::clone(&subscribers),
            current_breakpoint: Arc::clone(&current_breakpoint),
            collaborators,
        };
        thread::spawn(move || dispatch.run(rx));

        Self {
            sender: EventSender { tx },
            subscribers,
            current_breakpoint,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn publish(&self, event: SessionEvent) {
        self.sender.publish(event);
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Breakpoint the target last stopped at
    pub fn current_breakpoint(&self) -> Option<Breakpoint> {
        lock(&self.current_breakpoint).clone()
    }
}

struct Dispatch {
    subscribers: Subscribers,
    current_breakpoint: Arc<Mutex<Option<Breakpoint>>>,
    collaborators: Collaborators,
}

impl Dispatch {
    fn run(self, rx: Receiver<SessionEvent>) {
        for event in rx {
            self.fan_out(&event);
            if let SessionEvent::Exec(exec) = &event {
                if exec.is_stopped() {
                    self.handle_stopped(exec);
                }
            }
        }
        debug!("Event router stopped");
    }

    fn fan_out(&self, event: &SessionEvent) {
        // A failed send means the receiver was dropped
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn handle_stopped(&self, event: &GdbEvent) {
        let Some((path, line)) = event.frame().and_then(|frame| frame.location()) else {
            debug!("Stopped without a source location");
            return;
        };
        if !self.collaborators.navigator.can_open(&path) {
            debug!("Stopped in {} which does not exist locally", path.display());
            return;
        }

        let breakpoint = self
            .collaborators
            .breakpoints
            .find(&path, line)
            .unwrap_or_else(|| Breakpoint::new(path.clone(), line));
        *lock(&self.current_breakpoint) = Some(breakpoint);

        info!("Stopped at {}:{}", path.display(), line);
        if let Err(e) = self.collaborators.navigator.open_and_jump_to_line(&path, line) {
            error!("Failed to open {}:{}: {:#}", path.display(), line, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::parser::parse_results;
    use std::path::PathBuf;
    use std::time::Duration;

    const EXISTING: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");

    #[derive(Default)]
    struct RecordingNavigator {
        calls: Mutex<Vec<(PathBuf, u32)>>,
        fail: bool,
    }

    impl Navigator for RecordingNavigator {
        fn open_and_jump_to_line(&self, path: &Path, line: u32) -> anyhow::Result<()> {
            lock(&self.calls).push((path.to_path_buf(), line));
            if self.fail {
                anyhow::bail!("editor unavailable");
            }
            Ok(())
        }
    }

    struct Known(Breakpoint);

    impl BreakpointLookup for Known {
        fn find(&self, file: &Path, line: u32) -> Option<Breakpoint> {
            self.0.matches(file, line).then(|| self.0.clone())
        }
    }

    fn stopped_at(file: &str, line: u32) -> SessionEvent {
        let body = format!(
            r#"reason="breakpoint-hit",frame={{fullname="{}",line="{}"}}"#,
            file, line
        );
        SessionEvent::Exec(GdbEvent::new(
            "stopped",
            MiValue::Tuple(parse_results(&body).unwrap()),
        ))
    }

    fn recv(rx: &Receiver<SessionEvent>) -> SessionEvent {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_fan_out_preserves_order_for_every_subscriber() {
        let router = EventRouter::new(Collaborators::default());
        let a = router.subscribe();
        let b = router.subscribe();

        router.publish(SessionEvent::Console("one".to_string()));
        router.publish(SessionEvent::Log("two".to_string()));

        for rx in [&a, &b] {
            assert_eq!(recv(rx), SessionEvent::Console("one".to_string()));
            assert_eq!(recv(rx), SessionEvent::Log("two".to_string()));
        }
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_others() {
        let router = EventRouter::new(Collaborators::default());
        let dropped = router.subscribe();
        let kept = router.subscribe();
        drop(dropped);

        router.publish(SessionEvent::Exited);
        assert_eq!(recv(&kept), SessionEvent::Exited);
        assert_eq!(lock(&router.subscribers).len(), 1);
    }

    #[test]
    fn test_stopped_navigates_and_records_breakpoint() {
        let navigator = Arc::new(RecordingNavigator::default());
        let known = Breakpoint::new(EXISTING, 3);
        let router = EventRouter::new(Collaborators {
            navigator: navigator.clone(),
            breakpoints: Arc::new(Known(known.clone())),
        });
        let rx = router.subscribe();

        router.publish(stopped_at(EXISTING, 3));
        assert!(matches!(recv(&rx), SessionEvent::Exec(_)));
        // Navigation follows fan-out on the same thread
        router.publish(SessionEvent::Exited);
        recv(&rx);

        assert_eq!(*lock(&navigator.calls), vec![(PathBuf::from(EXISTING), 3)]);
        assert_eq!(router.current_breakpoint(), Some(known));
    }

    #[test]
    fn test_unknown_location_creates_transient_breakpoint() {
        let router = EventRouter::new(Collaborators::default());
        let rx = router.subscribe();
        router.publish(stopped_at(EXISTING, 9));
        router.publish(SessionEvent::Exited);
        recv(&rx);
        recv(&rx);
        assert_eq!(router.current_breakpoint(), Some(Breakpoint::new(EXISTING, 9)));
    }

    #[test]
    fn test_missing_file_is_published_but_not_opened() {
        let navigator = Arc::new(RecordingNavigator::default());
        let router = EventRouter::new(Collaborators {
            navigator: navigator.clone(),
            breakpoints: Arc::new(NoBreakpoints),
        });
        let rx = router.subscribe();

        router.publish(stopped_at("/no/such/file.vhd", 12));
        router.publish(SessionEvent::Exited);
        assert!(matches!(recv(&rx), SessionEvent::Exec(e) if e.is_stopped()));
        recv(&rx);

        assert!(lock(&navigator.calls).is_empty());
        assert_eq!(router.current_breakpoint(), None);
    }

    #[test]
    fn test_navigator_failure_keeps_router_alive() {
        let navigator = Arc::new(RecordingNavigator {
            fail: true,
            ..Default::default()
        });
        let router = EventRouter::new(Collaborators {
            navigator: navigator.clone(),
            breakpoints: Arc::new(NoBreakpoints),
        });
        let rx = router.subscribe();

        router.publish(stopped_at(EXISTING, 1));
        router.publish(SessionEvent::Console("after".to_string()));
        recv(&rx);
        assert_eq!(recv(&rx), SessionEvent::Console("after".to_string()));
        assert_eq!(lock(&navigator.calls).len(), 1);
    }
}
