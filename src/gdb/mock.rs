//! Scripted transport for driving sessions in tests

use crate::gdb::dispatcher::lock;
use crate::gdb::error::Result;
use crate::gdb::transport::{ExitListener, ExitNotice, Streams, Transport};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Responder = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Answers written commands with canned GDB output.
///
/// Replies go to the stdout line source, optionally after a delay. Every
/// write records how many earlier commands were still unanswered.
pub struct MockTransport {
    writes: Mutex<Vec<String>>,
    stdout: Arc<Mutex<Option<Sender<io::Result<String>>>>>,
    responder: Responder,
    on_interrupt: Mutex<Option<Responder>>,
    reply_delay: Mutex<Duration>,
    answered: Arc<AtomicUsize>,
    max_outstanding: AtomicUsize,
    interrupts: AtomicUsize,
    closed_input: AtomicUsize,
    exit: ExitNotice,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(&str) -> Vec<String> + Send + Sync + 'static,
    ) -> (Arc<Self>, Streams) {
        let (tx, rx) = mpsc::channel();
        let transport = Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            stdout: Arc::new(Mutex::new(Some(tx))),
            responder: Box::new(responder),
            on_interrupt: Mutex::new(None),
            reply_delay: Mutex::new(Duration::ZERO),
            answered: Arc::new(AtomicUsize::new(0)),
            max_outstanding: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            closed_input: AtomicUsize::new(0),
            exit: ExitNotice::default(),
        });
        let streams = Streams {
            stdout: Box::new(rx.into_iter()),
            stderr: Box::new(std::iter::empty()),
        };
        (transport, streams)
    }

    /// GDB that greets, then answers every command with `^done`
    pub fn done() -> (Arc<Self>, Streams) {
        let (transport, streams) = Self::new(|_| vec!["^done".to_string(), "(gdb) ".to_string()]);
        transport.emit("=thread-group-added,id=\"i1\"");
        (transport, streams)
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        *lock(&self.reply_delay) = delay;
    }

    pub fn set_on_interrupt(&self, f: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) {
        *lock(&self.on_interrupt) = Some(Box::new(f));
    }

    /// Push a line as if GDB printed it
    pub fn emit(&self, line: &str) {
        if let Some(tx) = lock(&self.stdout).as_ref() {
            let _ = tx.send(Ok(line.to_string()));
        }
    }

    /// End the stdout stream as if GDB died
    pub fn close_output(&self) {
        lock(&self.stdout).take();
    }

    /// Report the process as gone while stdout stays open, as when the
    /// debuggee still holds the inherited pipe
    pub fn exit_process(&self) {
        self.exit.fire();
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    /// Commands written after the warm-up sequence of `warmup_len` lines
    pub fn writes_after(&self, warmup_len: usize) -> Vec<String> {
        self.writes().into_iter().skip(warmup_len).collect()
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn input_closed(&self) -> bool {
        self.closed_input.load(Ordering::SeqCst) > 0
    }

    fn send_later(&self, lines: Vec<String>) {
        let delay = *lock(&self.reply_delay);
        let stdout = Arc::clone(&self.stdout);
        let answered = Arc::clone(&self.answered);
        let deliver = move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            // Counted before sending so the next write cannot observe a
            // delivered reply as outstanding
            answered.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = lock(&stdout).as_ref() {
                for line in lines {
                    let _ = tx.send(Ok(line));
                }
            }
        };
        if delay.is_zero() {
            deliver();
        } else {
            thread::spawn(deliver);
        }
    }
}

impl Transport for MockTransport {
    fn write_line(&self, line: &str) -> io::Result<()> {
        if self.input_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"));
        }
        let previous = {
            let mut writes = lock(&self.writes);
            writes.push(line.to_string());
            writes.len() - 1
        };
        let outstanding = previous - self.answered.load(Ordering::SeqCst).min(previous) + 1;
        self.max_outstanding.fetch_max(outstanding, Ordering::SeqCst);

        let reply = (self.responder)(line);
        self.send_later(reply);
        Ok(())
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = lock(&self.on_interrupt).as_ref() {
            for line in f("SIGINT") {
                self.emit(&line);
            }
        }
        Ok(())
    }

    fn close_input(&self) {
        self.closed_input.fetch_add(1, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.close_output();
        self.exit.fire();
    }

    fn on_exit(&self, listener: ExitListener) {
        self.exit.listen(listener);
    }
}
