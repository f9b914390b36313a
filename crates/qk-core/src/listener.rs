//! Connection events and the listener dispatch loop.
//!
//! The connection never calls user code directly: it pushes [`QuikEvent`]s
//! into an unbounded queue, and one dispatch task drains that queue and
//! drives every registered [`QuikListener`]. All `on_event` and `step` calls
//! therefore happen on a single task, so listener state needs no locking of
//! its own. Listeners must not block either call; longer work belongs on a
//! spawned task.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::protocol::{Channel, Frame};

/// What the connection reports to its listeners.
#[derive(Debug, Clone)]
pub enum QuikEvent {
    /// Both channels opened.
    Opened,
    /// Both channels closed (error teardown or shutdown).
    Closed,
    /// An unsolicited `callback` frame from the event channel, verbatim.
    Callback(Frame),
    /// A transport or decode failure on one channel. Decode failures do not
    /// tear the connection down; transport failures do, via the error flags.
    ChannelError { channel: Channel, message: String },
}

pub type QuikEventSender = mpsc::UnboundedSender<QuikEvent>;
pub type QuikEventReceiver = mpsc::UnboundedReceiver<QuikEvent>;

/// A consumer of connection events with periodic scheduling work.
///
/// `on_event` reacts to one event; `step` runs after every dispatch batch and
/// at least once per step interval, and is where time-based retries live.
#[async_trait]
pub trait QuikListener: Send {
    fn on_event(&mut self, event: &QuikEvent);

    async fn step(&mut self) {}
}

/// Drives all listeners from one task until shutdown or queue closure.
///
/// Events are dispatched in receipt order; after each batch (and at least
/// every `step_interval` when idle) every listener is stepped.
pub async fn run_listeners(
    mut events: QuikEventReceiver,
    mut listeners: Vec<Box<dyn QuikListener>>,
    mut shutdown_rx: watch::Receiver<bool>,
    step_interval: Duration,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = events.recv() => match received {
                Some(event) => {
                    dispatch(&mut listeners, &event);
                    while let Ok(event) = events.try_recv() {
                        dispatch(&mut listeners, &event);
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(step_interval) => {}
        }
        for listener in listeners.iter_mut() {
            listener.step().await;
        }
    }
}

fn dispatch(listeners: &mut [Box<dyn QuikListener>], event: &QuikEvent) {
    for listener in listeners.iter_mut() {
        listener.on_event(event);
    }
}
