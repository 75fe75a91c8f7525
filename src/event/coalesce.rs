//! Debounced delivery of events to the application.
//!
//! A [`Coalescer`] is driven by [`coalesce_loop`], a single task that owns the
//! coalescer outright. Ingestion and timer-driven flushes are therefore
//! serialized without any lock around the coalescer's maps.
//!
//! The loop has two timers per window:
//! - the *coalesce period* starts with the first coalescable event and bounds
//!   the window length;
//! - the *quiescent period* restarts with every coalescable event and closes
//!   the window early once the burst is over.

use super::types::Event;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub trait Coalescer: Send + 'static {
    /// Returns true if this coalescer takes the event.
    /// Other events bypass it and are forwarded unmodified.
    fn handle(&self, event: &Event) -> bool;

    fn coalesce(&mut self, event: Event);

    /// Emits everything pending and resets the pending state.
    fn flush(&mut self, out: &mpsc::Sender<Event>);
}

/// Hands an event downstream without waiting.
///
/// The consumer is the application; the producers are the probe and gossip
/// loops, which must never stall on a slow consumer. A full queue drops the
/// event.
pub fn deliver(out: &mpsc::Sender<Event>, event: Event) {
    match out.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!("Event queue full, dropping {}", event);
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            tracing::debug!("Event queue closed, dropping {}", event);
        }
    }
}

/// Wraps `out` with a coalescing stage and returns the stage's input side.
pub fn coalesced_event_channel<C: Coalescer>(
    out: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    queue_size: usize,
    coalescer: C,
) -> (mpsc::Sender<Event>, JoinHandle<()>) {
    let (in_tx, in_rx) = mpsc::channel(queue_size);
    let handle = tokio::spawn(coalesce_loop(
        in_rx,
        out,
        shutdown,
        coalesce_period,
        quiescent_period,
        coalescer,
    ));
    (in_tx, handle)
}

/// Runs until shutdown is signalled or the input closes, then drains one
/// final flush.
pub async fn coalesce_loop<C: Coalescer>(
    mut input: mpsc::Receiver<Event>,
    out: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    coalesce_period: Duration,
    quiescent_period: Duration,
    mut coalescer: C,
) {
    let mut stopping = *shutdown.borrow();

    while !stopping {
        let mut quantum: Option<Instant> = None;
        let mut quiescent: Option<Instant> = None;

        stopping = loop {
            // Disabled branches still evaluate their future, so give the
            // sleeps a placeholder deadline.
            let quantum_at = quantum.unwrap_or_else(Instant::now);
            let quiescent_at = quiescent.unwrap_or_else(Instant::now);

            tokio::select! {
                maybe = input.recv() => match maybe {
                    Some(event) => {
                        if !coalescer.handle(&event) {
                            deliver(&out, event);
                            continue;
                        }
                        let now = Instant::now();
                        quantum.get_or_insert(now + coalesce_period);
                        quiescent = Some(now + quiescent_period);
                        coalescer.coalesce(event);
                    }
                    None => break true,
                },
                _ = tokio::time::sleep_until(quantum_at), if quantum.is_some() => break false,
                _ = tokio::time::sleep_until(quiescent_at), if quiescent.is_some() => break false,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
            }
        };

        if stopping {
            drain_input(&mut input, &out, &mut coalescer);
        }
        coalescer.flush(&out);
    }

    tracing::debug!("Coalescer stopped");
}

/// Takes in whatever is still queued so the final flush includes it.
fn drain_input<C: Coalescer>(
    input: &mut mpsc::Receiver<Event>,
    out: &mpsc::Sender<Event>,
    coalescer: &mut C,
) {
    while let Ok(event) = input.try_recv() {
        if coalescer.handle(&event) {
            coalescer.coalesce(event);
        } else {
            deliver(out, event);
        }
    }
}
