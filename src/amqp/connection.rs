//! Connection thread.
//!
//! One OS thread owns the broker connection and runs a current-thread tokio
//! runtime. Every other thread talks to it through [`Scheduler::schedule`],
//! which queues a [`Command`] and hands back a [`Pending`] reply.
//!
//! Once the connection is gone every queued command, and every command
//! scheduled afterwards, resolves with `ConnectionClosed`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::session::{Session, SessionSettings};
use crate::layer::{LayerError, Result};

/// Reply half of a scheduled command.
pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// A raw message taken from a channel queue.
pub(crate) type Delivery = (String, Vec<u8>);

/// Work for the connection thread. Each variant carries its reply.
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        channel: String,
        body: Vec<u8>,
        reply: Reply<()>,
    },
    Receive {
        channels: Vec<String>,
        reply: Reply<Option<Delivery>>,
    },
    NewChannel {
        pattern: String,
        reply: Reply<String>,
    },
    DeclareChannel {
        channel: String,
        reply: Reply<()>,
    },
    GroupAdd {
        group: String,
        channel: String,
        reply: Reply<()>,
    },
    GroupDiscard {
        group: String,
        channel: String,
        reply: Reply<()>,
    },
    SendGroup {
        group: String,
        body: Vec<u8>,
        reply: Reply<()>,
    },
    Flush {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::Receive { .. } => "receive",
            Command::NewChannel { .. } => "new_channel",
            Command::DeclareChannel { .. } => "declare_channel",
            Command::GroupAdd { .. } => "group_add",
            Command::GroupDiscard { .. } => "group_discard",
            Command::SendGroup { .. } => "send_group",
            Command::Flush { .. } => "flush",
            Command::Close { .. } => "close",
        }
    }

    /// Resolve the reply with an error without running the command.
    pub(crate) fn fail(self, err: LayerError) {
        // A dropped receiver means the caller stopped waiting.
        match self {
            Command::Send { reply, .. }
            | Command::DeclareChannel { reply, .. }
            | Command::GroupAdd { reply, .. }
            | Command::GroupDiscard { reply, .. }
            | Command::SendGroup { reply, .. }
            | Command::Flush { reply }
            | Command::Close { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::Receive { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::NewChannel { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

// ============================================================================
// Pending replies
// ============================================================================

fn reply_dropped() -> LayerError {
    LayerError::ConnectionClosed("connection thread dropped the reply".to_string())
}

/// Reply to a scheduled command, resolved exactly once.
///
/// Block on it with [`Pending::wait`] or `.await` it from async code.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block the calling thread until the reply arrives.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(reply_dropped()))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(reply_dropped())))
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Thread-safe handle queueing commands for the connection thread.
#[derive(Debug, Clone)]
pub(crate) struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
}

impl Scheduler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, closed: Arc<AtomicBool>) -> Self {
        Self { tx, closed }
    }

    /// Queue the command built by `build` and return its pending reply.
    pub(crate) fn schedule<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Pending<T> {
        let (reply, rx) = oneshot::channel();
        let command = build(reply);

        if self.is_closed() {
            command.fail(LayerError::ConnectionClosed("connection is closed".to_string()));
        } else if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            command.fail(LayerError::ConnectionClosed(
                "connection thread has stopped".to_string(),
            ));
        }

        Pending { rx }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Mark the scheduler closed and fail whatever is still queued.
fn drain(rx: &mut mpsc::UnboundedReceiver<Command>, closed: &AtomicBool, reason: &str) -> usize {
    closed.store(true, Ordering::Release);
    rx.close();
    let mut failed = 0;
    while let Ok(command) = rx.try_recv() {
        command.fail(LayerError::ConnectionClosed(reason.to_string()));
        failed += 1;
    }
    failed
}

// ============================================================================
// Connection thread
// ============================================================================

/// Owner of the broker connection and its event loop.
#[derive(Debug)]
pub(crate) struct ConnectionThread {
    scheduler: Scheduler,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionThread {
    /// Connect and start the event loop.
    ///
    /// Blocks until the connection and control topology are ready. Must not be
    /// called from inside an async runtime.
    pub(crate) fn start(settings: SessionSettings) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let loop_closed = closed.clone();
        let handle = std::thread::Builder::new()
            .name("channel-layer-amqp".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        loop_closed.store(true, Ordering::Release);
                        let _ = ready_tx.send(Err(LayerError::ConnectionClosed(format!(
                            "Failed to build runtime: {}",
                            e
                        ))));
                        return;
                    }
                };
                runtime.block_on(run(settings, rx, loop_closed, ready_tx));
            })
            .map_err(|e| {
                LayerError::ConnectionClosed(format!("Failed to spawn connection thread: {}", e))
            })?;

        let ready = ready_rx.blocking_recv().unwrap_or_else(|_| {
            Err(LayerError::ConnectionClosed(
                "connection thread exited during startup".to_string(),
            ))
        });
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            scheduler: Scheduler::new(tx, closed),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Close the connection and join the thread. Safe to call repeatedly.
    ///
    /// Blocks, so it must not be called from inside an async runtime.
    pub(crate) fn close(&self) -> Result<()> {
        let result = if self.scheduler.is_closed() {
            Ok(())
        } else {
            self.scheduler
                .schedule(|reply| Command::Close { reply })
                .wait()
                .or_else(|e| if e.is_connection_closed() { Ok(()) } else { Err(e) })
        };

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Connection thread panicked");
            }
        }
        result
    }

    /// Ask the loop to close without waiting for it. The thread is detached
    /// and exits once the connection is closed.
    fn close_detached(&self) {
        if !self.scheduler.is_closed() {
            drop(self.scheduler.schedule(|reply| Command::Close { reply }));
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(handle);
        debug!("Detached connection thread from async context");
    }
}

impl Drop for ConnectionThread {
    fn drop(&mut self) {
        // Blocking on a runtime thread panics.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.close_detached();
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close broker connection cleanly");
        }
    }
}

/// Event loop: commands, dead-letter deliveries and connection errors.
async fn run(
    settings: SessionSettings,
    mut rx: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<()>>,
) {
    let (mut session, mut dead_letters, mut errors) = match Session::open(settings).await {
        Ok(opened) => {
            let _ = ready.send(Ok(()));
            opened
        }
        Err(e) => {
            closed.store(true, Ordering::Release);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let reason = loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Close { reply }) => {
                    let _ = reply.send(session.close().await);
                    break "connection closed by client".to_string();
                }
                Some(command) => {
                    let name = command.name();
                    session.execute(command).await;
                    if !session.is_connected() {
                        error!(command = name, "Broker connection lost");
                        break "broker connection lost".to_string();
                    }
                }
                None => {
                    let _ = session.close().await;
                    break "layer dropped".to_string();
                }
            },
            Some(delivery) = dead_letters.next() => match delivery {
                Ok(delivery) => session.handle_dead_letter(delivery).await,
                Err(e) => warn!(error = %e, "Dead-letter consumer error"),
            },
            Some(e) = errors.recv() => {
                error!(error = %e, "Broker connection error");
                break e;
            }
        }
    };

    let failed = drain(&mut rx, &closed, &reason);
    info!(reason = %reason, failed_commands = failed, "Connection thread stopped");
    debug!("Connection event loop exited");
}
