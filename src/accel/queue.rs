//! Command queue for offloaded work.
//!
//! Commands are recorded with `enqueue`, submitted with `flush` and waited on
//! with `finish`. A queue executes the commands of one submission in the
//! order they were enqueued, which is what keeps transfer-in, compute and
//! read-back of a single stream correctly ordered. Results written by a
//! read-back command are only valid once `finish` has returned.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Marker for an enqueued command. Events are issued in increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event(u64);

impl Event {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Host to device transfer.
    Write,
    /// Kernel execution on device memory.
    Compute,
    /// Device to host transfer.
    Read,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Write => f.write_str("write"),
            CommandKind::Compute => f.write_str("compute"),
            CommandKind::Read => f.write_str("read"),
        }
    }
}

type CommandOp = Box<dyn FnOnce() -> Result<()> + Send>;

/// One unit of queued work.
pub struct Command {
    kind: CommandKind,
    label: String,
    op: CommandOp,
}

impl Command {
    pub fn new(
        kind: CommandKind,
        label: impl Into<String>,
        op: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            kind,
            label: label.into(),
            op: Box::new(op),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Execute the command. Queue implementations call this.
    pub fn run(self) -> Result<()> {
        (self.op)()
    }
}

/// Submission channel to an accelerator.
pub trait CommandQueue: Send + Sync {
    /// Record a command. Nothing runs before the next `flush`.
    fn enqueue(&self, command: Command) -> Result<Event>;

    /// Submit everything recorded so far without waiting.
    fn flush(&self) -> Result<()>;

    /// Submit and block until every submitted command has completed.
    ///
    /// Reports the first command failure since the previous `finish`.
    fn finish(&self) -> Result<()>;

    /// True once the command behind `event` has completed.
    fn is_complete(&self, event: Event) -> bool;
}

// ----------------------------------------------------------------------------
// Host queue: in-order execution on a dedicated worker thread
// ----------------------------------------------------------------------------

enum Message {
    Batch(Vec<(Event, Command)>),
    Fence(Sender<()>),
}

/// Command queue backed by a host worker thread.
pub struct HostQueue {
    pending: Mutex<Vec<(Event, Command)>>,
    next_event: AtomicU64,
    completed: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<String>>>,
    sender: Mutex<Option<Sender<Message>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    pub fn new(device_name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let completed = Arc::new(AtomicU64::new(0));
        let failure = Arc::new(Mutex::new(None));
        let completed_thread = completed.clone();
        let failure_thread = failure.clone();

        let join = std::thread::Builder::new()
            .name(format!("queue:{}", device_name))
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Batch(commands) => {
                            for (event, command) in commands {
                                let label = format!("{} {}", command.kind(), command.label());
                                if let Err(err) = command.run() {
                                    log::error!("command {} failed: {:#}", label, err);
                                    if let Ok(mut slot) = failure_thread.lock() {
                                        slot.get_or_insert_with(|| format!("{}: {:#}", label, err));
                                    }
                                }
                                completed_thread.store(event.sequence(), Ordering::SeqCst);
                            }
                        }
                        Message::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|err| anyhow!("failed to start command queue thread: {}", err))?;

        Ok(Self {
            pending: Mutex::new(Vec::new()),
            next_event: AtomicU64::new(1),
            completed,
            failure,
            sender: Mutex::new(Some(sender)),
            join: Mutex::new(Some(join)),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| anyhow!("command queue sender lock poisoned"))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("command queue is shut down"))?;
        sender
            .send(message)
            .map_err(|_| anyhow!("command queue thread has stopped"))
    }
}

impl CommandQueue for HostQueue {
    fn enqueue(&self, command: Command) -> Result<Event> {
        let event = Event::new(self.next_event.fetch_add(1, Ordering::SeqCst));
        self.pending
            .lock()
            .map_err(|_| anyhow!("command queue lock poisoned"))?
            .push((event, command));
        Ok(event)
    }

    fn flush(&self) -> Result<()> {
        let batch = std::mem::take(
            &mut *self
                .pending
                .lock()
                .map_err(|_| anyhow!("command queue lock poisoned"))?,
        );
        if batch.is_empty() {
            return Ok(());
        }
        self.send(Message::Batch(batch))
    }

    fn finish(&self) -> Result<()> {
        self.flush()?;
        let (done_tx, done_rx) = mpsc::channel();
        self.send(Message::Fence(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| anyhow!("command queue thread stopped before finishing"))?;

        let failure = self
            .failure
            .lock()
            .map_err(|_| anyhow!("command queue failure lock poisoned"))?
            .take();
        match failure {
            Some(message) => Err(anyhow!("queued command failed: {}", message)),
            None => Ok(()),
        }
    }

    fn is_complete(&self, event: Event) -> bool {
        self.completed.load(Ordering::SeqCst) >= event.sequence()
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once queued work drains.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut join) = self.join.lock() {
            if let Some(join) = join.take() {
                if join.join().is_err() {
                    log::error!("command queue thread panicked");
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
