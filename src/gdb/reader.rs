//! Background readers for GDB output streams

use crate::gdb::dispatcher::SessionShared;
use crate::gdb::parser::{MiOutputRecord, MiParser};
use crate::gdb::router::EventSender;
use crate::gdb::transport::LineSource;
use crate::gdb::types::*;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, Span};

/// Which stream a reader drains; only stdout ending means GDB is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

pub struct OutputReader {
    parser: MiParser,
    shared: Arc<SessionShared>,
    events: EventSender,
}

impl OutputReader {
    pub fn new(shared: Arc<SessionShared>, events: EventSender) -> Self {
        Self {
            parser: MiParser::new(),
            shared,
            events,
        }
    }

    /// Drain `lines` on a dedicated thread inside `span`
    pub fn spawn(self, lines: LineSource, kind: StreamKind, span: Span) -> JoinHandle<()> {
        thread::spawn(move || {
            let _entered = span.enter();
            self.read_output_loop(lines, kind);
        })
    }

    fn read_output_loop(&self, lines: LineSource, kind: StreamKind) {
        for line in lines {
            match line {
                Ok(line) => self.handle_line(&line),
                Err(e) => {
                    error!("Error reading GDB {:?}: {}", kind, e);
                    break;
                }
            }
        }

        match kind {
            StreamKind::Stdout => {
                info!("GDB output closed");
                if self.shared.mark_exited() {
                    self.events.publish(SessionEvent::Exited);
                }
            }
            StreamKind::Stderr => debug!("GDB stderr closed"),
        }
    }

    pub fn handle_line(&self, line: &str) {
        debug!("GDB output: {}", line);
        self.shared.mark_client_ready();
        self.events.publish(SessionEvent::Output(line.to_string()));

        let record = match self.parser.parse_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to parse GDB output: {}", e);
                return;
            }
        };

        match record {
            MiOutputRecord::Result(result) => {
                if result.status == CommandStatus::Error {
                    let message = result.message().unwrap_or(&result.raw).to_string();
                    self.events.publish(SessionEvent::Log(message));
                }
                self.shared.deliver_result(result);
            }
            MiOutputRecord::Console(text) => {
                if text.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("quit")) {
                    self.shared.set_running(false);
                }
                self.events.publish(SessionEvent::Console(text));
            }
            MiOutputRecord::Log(text) => self.events.publish(SessionEvent::Log(text)),
            MiOutputRecord::Exec(event) => {
                self.shared.apply_exec_event(&event);
                self.events.publish(SessionEvent::Exec(event));
            }
            MiOutputRecord::Notify(event) => self.events.publish(SessionEvent::Notify(event)),
            MiOutputRecord::Target(text) => self.events.publish(SessionEvent::Target(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::router::{Collaborators, EventRouter};
    use std::io;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    fn reader() -> (OutputReader, Arc<SessionShared>, Receiver<SessionEvent>, EventRouter) {
        let router = EventRouter::new(Collaborators::default());
        let rx = router.subscribe();
        let shared = Arc::new(SessionShared::new());
        (OutputReader::new(Arc::clone(&shared), router.sender()), shared, rx, router)
    }

    fn drain(rx: &Receiver<SessionEvent>, count: usize) -> Vec<SessionEvent> {
        (0..count)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect()
    }

    #[test]
    fn test_every_line_is_published_raw_then_classified() {
        let (reader, shared, rx, _router) = reader();
        reader.handle_line(r#"~"GNU gdb 14.2\n""#);
        assert!(shared.wait_client_ready(Duration::ZERO));
        assert_eq!(
            drain(&rx, 2),
            vec![
                SessionEvent::Output(r#"~"GNU gdb 14.2\n""#.to_string()),
                SessionEvent::Console(r#"GNU gdb 14.2\n"#.to_string()),
            ]
        );
    }

    #[test]
    fn test_error_result_is_also_logged() {
        let (reader, _shared, rx, _router) = reader();
        reader.handle_line(r#"^error,msg="No symbol \"x\" in current context.""#);
        let events = drain(&rx, 2);
        assert_eq!(
            events[1],
            SessionEvent::Log(r#"No symbol \"x\" in current context."#.to_string())
        );
    }

    #[test]
    fn test_exec_records_update_running_flag() {
        let (reader, shared, rx, _router) = reader();
        reader.handle_line("*running,thread-id=\"all\"");
        assert!(shared.is_running());
        assert_eq!(shared.state(), SessionState::Running);
        reader.handle_line("*stopped,reason=\"end-stepping-range\"");
        assert!(!shared.is_running());
        assert_eq!(shared.state(), SessionState::Stopped);
        let events = drain(&rx, 4);
        assert!(matches!(&events[3], SessionEvent::Exec(e) if e.is_stopped()));
    }

    #[test]
    fn test_quit_console_line_clears_running() {
        let (reader, shared, _rx, _router) = reader();
        shared.set_running(true);
        reader.handle_line(r#"~"Quit\n""#);
        assert!(!shared.is_running());
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let (reader, shared, rx, _router) = reader();
        reader.handle_line(r#"^done,value="5"#);
        reader.handle_line(r#"=thread-group-added,id="i1""#);
        let events = drain(&rx, 3);
        assert!(matches!(&events[2], SessionEvent::Notify(e) if e.name == "thread-group-added"));
        assert!(!shared.is_exited());
    }

    #[test]
    fn test_stdout_eof_marks_session_exited() {
        let (reader, shared, rx, _router) = reader();
        let lines: LineSource = Box::new(
            vec![Ok("(gdb) ".to_string()), Err(io::Error::from(io::ErrorKind::BrokenPipe))]
                .into_iter(),
        );
        reader.spawn(lines, StreamKind::Stdout, Span::none()).join().unwrap();
        assert!(shared.is_exited());
        assert_eq!(shared.state(), SessionState::Exited);
        assert_eq!(drain(&rx, 2)[1], SessionEvent::Exited);
    }

    #[test]
    fn test_stderr_eof_keeps_session_alive() {
        let (reader, shared, _rx, _router) = reader();
        let lines: LineSource = Box::new(std::iter::once(Ok("warning: no debug info".to_string())));
        reader.spawn(lines, StreamKind::Stderr, Span::none()).join().unwrap();
        assert!(!shared.is_exited());
    }
}
