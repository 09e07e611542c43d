//! Drivers that decide when template resources are processed.

mod interval;
mod once;
mod watch;

use std::thread;
use std::time::Duration;

use crossbeam_channel::{never, select, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::{ProcessError, Result, TopodError};

pub use interval::IntervalProcessor;
pub use once::process_once;
pub use watch::Watcher;

/// Pause before re-establishing a watch that failed for a reason other than
/// an expired long-poll.
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Suggested capacity for the error channel handed to a processor.
pub const ERROR_CHANNEL_CAPACITY: usize = 64;

/// A long-running driver. `process` blocks until the stop channel closes and
/// closes the done channel on return.
pub trait Processor: Send {
    fn process(self: Box<Self>);
}

/// Runs `processor` on a thread of its own and logs what it reports until it
/// returns.
///
/// A message on `signals` drops `stop`, asking the processor to wind down. A
/// disconnected `signals` channel is ignored. Errors still queued when the
/// processor returns are logged before this returns.
pub fn supervise(
    processor: Box<dyn Processor>,
    stop: Sender<()>,
    done: Receiver<()>,
    errors: Receiver<ProcessError>,
    signals: Receiver<()>,
) -> Result<()> {
    let worker = thread::Builder::new()
        .name("processor".to_string())
        .spawn(move || processor.process())
        .map_err(TopodError::Spawn)?;

    let mut stop = Some(stop);
    let mut errors = errors;
    let mut signals = signals;
    loop {
        select! {
            recv(errors) -> msg => match msg {
                Ok(e) => log::error!("{}", e),
                Err(_) => errors = never(),
            },
            recv(signals) -> msg => {
                if msg.is_ok() {
                    log::info!("Shutdown signal received, stopping");
                    stop.take();
                }
                signals = never();
            },
            recv(done) -> _ => break,
        }
    }
    drop(stop);

    let joined = worker.join();
    while let Ok(e) = errors.try_recv() {
        log::error!("{}", e);
    }
    joined.map_err(|_| TopodError::Panicked)
}

/// True once every stop sender has been dropped.
pub(crate) fn is_stopped(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Sleeps for `delay` unless stopped first. Returns true if stopped.
pub(crate) fn wait_or_stop(stop: &Receiver<()>, delay: Duration) -> bool {
    select! {
        recv(stop) -> _ => true,
        default(delay) => false,
    }
}

/// Hands `err` to whoever listens on the error channel without blocking.
pub(crate) fn report(errors: &Sender<ProcessError>, err: ProcessError) {
    match errors.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) => {
            log::warn!("Error channel full, dropping error: {}", err)
        }
        Err(TrySendError::Disconnected(err)) => log::error!("{}", err),
    }
}
