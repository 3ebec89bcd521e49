//! The scheduling primitive: a typed graph of actions connected by one-shot
//! pipes, executed sequentially with uniform completion reporting.

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The closed set of completion codes an action can report. The attempter's
/// recovery policy keys off these, so new failure modes get a new code, not
/// an overload of an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionCode {
    Success,
    /// The server offered nothing. Soft: resets the failure counter.
    NoUpdate,
    /// Transport failure. Soft: the attempter advances the URL rotation.
    Network,
    /// The payload at this URL is damaged; a mirror may still be good.
    PayloadMismatch,
    /// The completed payload does not hash to what the response promised.
    Hash,
    /// The payload signature does not verify.
    Signature,
    /// Disk or state I/O failed; the attempt is over.
    Io,
    /// The server's certificate was rejected.
    Security,
    /// The run was cancelled. Re-entry is allowed.
    Aborted,
    /// Invariant violation. The process should not continue.
    Internal,
}

serde_plain::derive_display_from_serialize!(ActionCode);

impl ActionCode {
    pub fn is_success(self) -> bool {
        self == ActionCode::Success
    }

    /// Whether this outcome feeds the scheduler's backoff.
    pub fn counts_as_failure(self) -> bool {
        !matches!(
            self,
            ActionCode::Success | ActionCode::NoUpdate | ActionCode::Aborted
        )
    }
}

/// A one-shot, single-reader channel between two consecutive actions. The
/// downstream action takes the value exactly once after the upstream
/// completes; the pipe is a capability, not a queue.
#[derive(Debug)]
pub struct Pipe<T>(Rc<RefCell<Option<T>>>);

impl<T> Pipe<T> {
    /// Creates both ends of a pipe: the upstream writer and the downstream
    /// reader share the slot.
    pub fn pair() -> (Pipe<T>, Pipe<T>) {
        let slot = Rc::new(RefCell::new(None));
        (Pipe(Rc::clone(&slot)), Pipe(slot))
    }

    pub fn put(&self, value: T) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }
}

/// Cooperative cancellation. A run-scoped flag chains to the process-wide
/// termination flag, so either cancels the running action at its next I/O
/// boundary.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag {
    local: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child flag that also observes `self`.
    pub fn scoped(&self) -> Self {
        Self {
            local: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.local)),
        }
    }

    pub fn abort(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.local.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }
}

/// One stage of the pipeline. Implementations hold their input and output
/// pipes; an action that requires input refuses to run without it (that is
/// an [`ActionCode::Internal`] failure, not a recoverable one).
#[async_trait(?Send)]
pub trait Action {
    fn name(&self) -> &'static str;

    async fn perform(&mut self) -> ActionCode;

    /// Called instead of [`perform`] when the graph is abandoned.
    ///
    /// [`perform`]: Action::perform
    fn terminate(&mut self) {}
}

/// Reported to the processor's owner after each action completes.
pub type CompletionHook<'a> = dyn Fn(&'static str, ActionCode) + 'a;

/// The outcome of one full graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOutcome {
    /// The action that produced the final code.
    pub action: &'static str,
    pub code: ActionCode,
}

/// Runs enqueued actions in order. The first non-success code flushes the
/// remaining actions with `terminate()` and becomes the graph's outcome.
pub struct ActionProcessor<'a> {
    actions: Vec<Box<dyn Action>>,
    abort: AbortFlag,
    on_complete: Option<Box<CompletionHook<'a>>>,
}

impl<'a> ActionProcessor<'a> {
    pub fn new(abort: AbortFlag) -> Self {
        Self {
            actions: Vec::new(),
            abort,
            on_complete: None,
        }
    }

    pub fn enqueue(&mut self, action: Box<dyn Action>) {
        self.actions.push(action);
    }

    /// Installs a hook invoked with each action's completion code.
    pub fn on_complete<F: Fn(&'static str, ActionCode) + 'a>(&mut self, hook: F) {
        self.on_complete = Some(Box::new(hook));
    }

    /// Requests cancellation; the running action observes it at its next
    /// I/O boundary.
    pub fn stop(&self) {
        self.abort.abort();
    }

    pub async fn start(&mut self) -> ProcessorOutcome {
        let mut actions = std::mem::take(&mut self.actions);
        let mut outcome = ProcessorOutcome {
            action: "empty-graph",
            code: ActionCode::Success,
        };
        let mut iter = actions.iter_mut();
        for action in iter.by_ref() {
            let code = if self.abort.is_aborted() {
                ActionCode::Aborted
            } else {
                action.perform().await
            };
            info!("Action {} completed with code {}", action.name(), code);
            if let Some(hook) = &self.on_complete {
                hook(action.name(), code);
            }
            outcome = ProcessorOutcome {
                action: action.name(),
                code,
            };
            if !code.is_success() {
                break;
            }
        }
        for pending in iter {
            pending.terminate();
        }
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{CollectorAction, FeederAction};
    use super::*;

    struct FixedAction {
        code: ActionCode,
        terminated: Rc<RefCell<bool>>,
    }

    #[async_trait(?Send)]
    impl Action for FixedAction {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn perform(&mut self) -> ActionCode {
            self.code
        }

        fn terminate(&mut self) {
            *self.terminated.borrow_mut() = true;
        }
    }

    #[tokio::test]
    async fn values_flow_through_pipes() {
        let (tx, rx) = Pipe::pair();
        let feeder = FeederAction::new(42u64, tx);
        let (collector, collected) = CollectorAction::new(rx);

        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(feeder));
        processor.enqueue(Box::new(collector));
        let outcome = processor.start().await;

        assert_eq!(outcome.code, ActionCode::Success);
        assert_eq!(outcome.action, "collector");
        assert_eq!(*collected.borrow(), Some(42));
    }

    #[tokio::test]
    async fn failure_terminates_the_rest() {
        let terminated = Rc::new(RefCell::new(false));
        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(FixedAction {
            code: ActionCode::Network,
            terminated: Rc::new(RefCell::new(false)),
        }));
        processor.enqueue(Box::new(FixedAction {
            code: ActionCode::Success,
            terminated: Rc::clone(&terminated),
        }));

        let outcome = processor.start().await;
        assert_eq!(outcome.code, ActionCode::Network);
        assert!(*terminated.borrow(), "pending action was not terminated");
    }

    #[tokio::test]
    async fn missing_input_is_an_internal_error() {
        let (_, rx) = Pipe::<u64>::pair();
        let (collector, collected) = CollectorAction::new(rx);
        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(collector));

        let outcome = processor.start().await;
        assert_eq!(outcome.code, ActionCode::Internal);
        assert_eq!(*collected.borrow(), None);
    }

    #[tokio::test]
    async fn aborted_flag_short_circuits() {
        let abort = AbortFlag::new();
        abort.abort();
        let terminated = Rc::new(RefCell::new(false));
        let mut processor = ActionProcessor::new(abort);
        processor.enqueue(Box::new(FixedAction {
            code: ActionCode::Success,
            terminated: Rc::clone(&terminated),
        }));

        let outcome = processor.start().await;
        assert_eq!(outcome.code, ActionCode::Aborted);
    }

    #[tokio::test]
    async fn completion_hook_sees_every_action() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_hook = Rc::clone(&seen);

        let (tx, rx) = Pipe::pair();
        let feeder = FeederAction::new("value", tx);
        let (collector, _) = CollectorAction::new(rx);
        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(feeder));
        processor.enqueue(Box::new(collector));
        processor.on_complete(move |name, code| seen_hook.borrow_mut().push((name, code)));

        processor.start().await;
        assert_eq!(
            *seen.borrow(),
            vec![
                ("feeder", ActionCode::Success),
                ("collector", ActionCode::Success)
            ]
        );
    }

    #[test]
    fn scoped_flag_observes_parent() {
        let parent = AbortFlag::new();
        let child = parent.scoped();
        assert!(!child.is_aborted());
        parent.abort();
        assert!(child.is_aborted());

        let sibling = parent.scoped();
        assert!(sibling.is_aborted());
    }

    #[test]
    fn code_classification() {
        assert!(ActionCode::Success.is_success());
        assert!(!ActionCode::NoUpdate.counts_as_failure());
        assert!(!ActionCode::Aborted.counts_as_failure());
        assert!(ActionCode::Network.counts_as_failure());
        assert!(ActionCode::Signature.counts_as_failure());
        assert_eq!(ActionCode::NoUpdate.to_string(), "no-update");
    }
}
