//! Signal-safe shutdown coordination. A dedicated thread turns termination
//! signals into flag flips plus a wake-up for the event loop; the loop and
//! the running action graph observe the flag cooperatively.

use crate::action::AbortFlag;
use crate::error::{self, Result};
use log::info;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use snafu::ResultExt;
use std::thread;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub struct Terminator {
    flag: AbortFlag,
    // Keeps the wake channel open when no signal thread holds a sender.
    _wake: Option<mpsc::Sender<()>>,
}

impl Terminator {
    /// Installs the signal handler thread. The returned receiver fires once
    /// when a termination signal arrives, so a sleeping event loop wakes
    /// promptly; the flag is the parent of every run's abort flag.
    pub fn init() -> Result<(Self, mpsc::Receiver<()>)> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let flag = AbortFlag::new();
        let handler_flag = flag.clone();
        let mut signals = Signals::new([SIGTERM, SIGINT]).context(error::SignalSnafu)?;
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {}, shutting down", signal);
                handler_flag.abort();
                let _ = wake_tx.try_send(());
            }
        });
        Ok((Self { flag, _wake: None }, wake_rx))
    }

    /// A terminator that only trips when a test asks it to.
    pub fn noop() -> (Self, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        (
            Self {
                flag: AbortFlag::new(),
                _wake: Some(wake_tx),
            },
            wake_rx,
        )
    }

    pub fn should_exit(&self) -> bool {
        self.flag.is_aborted()
    }

    /// Abort flag for one attempt; trips on cancellation of the run or on
    /// process termination.
    pub fn run_flag(&self) -> AbortFlag {
        self.flag.scoped()
    }

    pub fn trip(&self) {
        self.flag.abort();
    }
}
