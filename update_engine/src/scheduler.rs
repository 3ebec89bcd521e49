//! The periodic check trigger: a jittered interval, exponential backoff
//! with full jitter after failures, and the event loop that owns the
//! attempter, the bus-adapter channel, and the termination wake-up.

use crate::action::ActionCode;
use crate::attempter::{self, UpdateAttempter};
use crate::config::Config;
use crate::status::StatusSnapshot;
use crate::terminator::Terminator;
use log::{debug, error, info};
use rand::Rng;
use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// Requests arriving from the system-bus service through its bounded
/// channel.
#[derive(Debug)]
pub enum EngineRequest {
    CheckNow,
    Abort,
    Status(oneshot::Sender<StatusSnapshot>),
}

pub struct UpdateCheckScheduler {
    base_interval: Duration,
    interval_fuzz: Duration,
    backoff_cap: Duration,
    startup_delay: Duration,
    consecutive_failures: u32,
}

impl UpdateCheckScheduler {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_interval: Duration::from_secs(config.check_interval_secs),
            interval_fuzz: Duration::from_secs(config.interval_fuzz_secs),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
            startup_delay: Duration::from_secs(config.startup_delay_secs),
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The pre-jitter interval for a given failure count: the base interval
    /// doubled per failure, bounded by the cap. Monotonically non-decreasing
    /// in the failure count.
    pub fn backoff_target(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.base_interval;
        }
        let multiplier = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        cmp::min(
            self.backoff_cap,
            self.base_interval.saturating_mul(multiplier),
        )
    }

    /// The concrete delay until the next check: base ± fuzz when healthy,
    /// full jitter over the backoff target after failures.
    fn next_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let delay = if self.consecutive_failures == 0 {
            let fuzz = self.interval_fuzz.as_secs();
            let base = self.base_interval.as_secs();
            let low = base.saturating_sub(fuzz / 2);
            Duration::from_secs(rng.gen_range(low..=low + fuzz))
        } else {
            let target = self.backoff_target(self.consecutive_failures).as_secs();
            Duration::from_secs(rng.gen_range(0..=target))
        };
        cmp::max(delay, Duration::from_secs(1))
    }

    /// Delay before the first check after startup: full jitter over half to
    /// five halves of the configured base, so a crash-looping engine cannot
    /// hammer the server in lockstep.
    fn startup_jitter(&self) -> Duration {
        let base = self.startup_delay.as_secs().max(2);
        let mut rng = rand::thread_rng();
        Duration::from_secs(rng.gen_range(base / 2..=base.saturating_mul(5) / 2))
    }

    /// Folds one attempt outcome into the backoff state. `no-update` is a
    /// healthy outcome and resets the counter; a cancelled run changes
    /// nothing.
    pub fn record_attempt(&mut self, code: ActionCode) {
        if code.counts_as_failure() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            debug!(
                "Attempt failed with {}, {} consecutive failures",
                code, self.consecutive_failures
            );
        } else if code != ActionCode::Aborted {
            self.consecutive_failures = 0;
        }
    }

    /// Runs one attempt and folds its outcome into the backoff state. An
    /// internal invariant violation terminates the process; the supervisor
    /// restarts it and the attempter recovers from persisted state.
    async fn run_one_check(&mut self, attempter: &Rc<RefCell<UpdateAttempter>>) {
        let code = attempter::run_update(Rc::clone(attempter)).await;
        if code == ActionCode::Internal {
            error!("Internal error, terminating for a clean restart");
            std::process::exit(1);
        }
        self.record_attempt(code);
    }

    /// The engine's event loop. One check at a time: while an attempt runs,
    /// neither the timer nor bus requests are serviced, which is exactly the
    /// "no concurrent checks" rule.
    pub async fn run(
        mut self,
        attempter: Rc<RefCell<UpdateAttempter>>,
        requests: mpsc::Receiver<EngineRequest>,
        terminator: Terminator,
        mut termination_wake: mpsc::Receiver<()>,
    ) {
        // When the bus adapter goes away the periodic loop keeps running on
        // the timer alone.
        let mut requests = Some(requests);
        let mut delay = self.startup_jitter();
        info!("First update check in {}s", delay.as_secs());
        loop {
            if terminator.should_exit() {
                break;
            }
            let next_request = async {
                match requests.as_mut() {
                    Some(receiver) => receiver.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = sleep(delay) => {
                    self.run_one_check(&attempter).await;
                    delay = self.next_delay();
                    info!("Next update check in {}s", delay.as_secs());
                }
                request = next_request => match request {
                    None => requests = None,
                    Some(EngineRequest::CheckNow) => {
                        self.run_one_check(&attempter).await;
                        delay = self.next_delay();
                    }
                    Some(EngineRequest::Abort) => attempter.borrow().abort(),
                    Some(EngineRequest::Status(reply)) => {
                        let _ = reply.send(attempter.borrow().status_snapshot());
                    }
                },
                _ = termination_wake.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> UpdateCheckScheduler {
        UpdateCheckScheduler::from_config(&Config {
            check_interval_secs: 2700,
            interval_fuzz_secs: 600,
            backoff_cap_secs: 14400,
            ..Default::default()
        })
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let s = scheduler();
        let mut previous = Duration::ZERO;
        for failures in 0..20 {
            let target = s.backoff_target(failures);
            assert!(target >= previous, "backoff shrank at {failures}");
            assert!(target <= Duration::from_secs(14400));
            previous = target;
        }
        assert_eq!(s.backoff_target(1), Duration::from_secs(5400));
        assert_eq!(s.backoff_target(2), Duration::from_secs(10800));
        assert_eq!(s.backoff_target(3), Duration::from_secs(14400));
        assert_eq!(s.backoff_target(19), Duration::from_secs(14400));
    }

    #[test]
    fn failures_accumulate_and_reset() {
        let mut s = scheduler();
        s.record_attempt(ActionCode::Network);
        s.record_attempt(ActionCode::Signature);
        assert_eq!(s.consecutive_failures(), 2);

        // Cancellation leaves the counter alone.
        s.record_attempt(ActionCode::Aborted);
        assert_eq!(s.consecutive_failures(), 2);

        // A "no update" answer is a healthy check.
        s.record_attempt(ActionCode::NoUpdate);
        assert_eq!(s.consecutive_failures(), 0);

        s.record_attempt(ActionCode::Io);
        assert_eq!(s.consecutive_failures(), 1);
        s.record_attempt(ActionCode::Success);
        assert_eq!(s.consecutive_failures(), 0);
    }

    #[test]
    fn healthy_delay_stays_inside_the_fuzz_window() {
        let s = scheduler();
        for _ in 0..100 {
            let delay = s.next_delay().as_secs();
            assert!((2400..=3000).contains(&delay), "delay {delay} out of window");
        }
    }

    #[test]
    fn startup_delay_spans_one_to_five_minutes_by_default() {
        let s = UpdateCheckScheduler::from_config(&Config::default());
        for _ in 0..100 {
            let delay = s.startup_jitter().as_secs();
            assert!((60..=300).contains(&delay), "delay {delay} out of window");
        }
    }

    #[test]
    fn backoff_delay_is_fully_jittered_and_bounded() {
        let mut s = scheduler();
        for _ in 0..3 {
            s.record_attempt(ActionCode::Network);
        }
        for _ in 0..100 {
            let delay = s.next_delay();
            assert!(delay <= Duration::from_secs(14400));
            assert!(delay >= Duration::from_secs(1));
        }
    }
}
