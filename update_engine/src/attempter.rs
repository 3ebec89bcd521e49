//! The lifecycle owner of an update attempt: builds the action graph, maps
//! completion codes onto recovery policy, drives the observable state
//! machine, and handles the deferred boot-flag commit.

use crate::action::{AbortFlag, ActionCode, ActionProcessor, Pipe, ProcessorOutcome};
use crate::bootable::BootableMarkerAction;
use crate::download::DownloadAction;
use crate::install_plan::InstallPlan;
use crate::omaha_request::OmahaRequestAction;
use crate::payload_processor::PayloadProcessorAction;
use crate::postinstall::{PostinstallExecutor, PostinstallRunnerAction};
use crate::prefs::BOOT_ID_KEY;
use crate::response_handler::ResponseHandlerAction;
use crate::status::{StatusObserver, StatusSnapshot, UpdateStatus};
use crate::system_state::SystemState;
use crate::terminator::Terminator;
use bootslot::BootFlagClient;
use log::{error, info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use update_payload::{reset_update_progress, RESPONSE_HASH_KEY};

/// Pref holding the last attempt's error code, for observability across
/// restarts.
const LAST_ERROR_KEY: &str = "last-error-code";

pub struct UpdateAttempter {
    system: SystemState,
    boot_flags: Rc<dyn BootFlagClient>,
    postinstall: Rc<dyn PostinstallExecutor>,
    terminator: Terminator,
    observers: Vec<Box<dyn StatusObserver>>,
    status: UpdateStatus,
    last_error: Option<ActionCode>,
    display_version: String,
    bytes_written: u64,
    payload_size: u64,
    last_percent: u64,
    run_abort: Option<AbortFlag>,
    boot_flags_updated: bool,
    plan_sink: Rc<RefCell<Option<InstallPlan>>>,
}

impl UpdateAttempter {
    pub fn new(
        system: SystemState,
        boot_flags: Rc<dyn BootFlagClient>,
        postinstall: Rc<dyn PostinstallExecutor>,
        terminator: Terminator,
    ) -> Self {
        Self {
            system,
            boot_flags,
            postinstall,
            terminator,
            observers: Vec::new(),
            status: UpdateStatus::Idle,
            last_error: None,
            display_version: String::new(),
            bytes_written: 0,
            payload_size: 0,
            last_percent: u64::MAX,
            run_abort: None,
            boot_flags_updated: false,
            plan_sink: Rc::new(RefCell::new(None)),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn StatusObserver>) {
        self.observers.push(observer);
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<ActionCode> {
        self.last_error
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            display_version: self.display_version.clone(),
            bytes_written: self.bytes_written,
            payload_size: self.payload_size,
            last_error: self.last_error,
        }
    }

    pub fn broadcast_status(&self) {
        let snapshot = self.status_snapshot();
        for observer in &self.observers {
            observer.on_status(&snapshot);
        }
    }

    fn set_status(&mut self, status: UpdateStatus) {
        self.status = status;
        self.broadcast_status();
    }

    /// Requests cancellation of the attempt in flight, if any. The running
    /// action observes the flag at its next I/O boundary.
    pub fn abort(&self) {
        if let Some(flag) = &self.run_abort {
            info!("Cancelling the running update attempt");
            flag.abort();
        }
    }

    fn report_progress(&mut self, bytes: u64, total: u64) {
        self.bytes_written = bytes;
        self.payload_size = total;
        let percent = if total > 0 { bytes * 100 / total } else { 0 };
        if percent != self.last_percent {
            self.last_percent = percent;
            self.broadcast_status();
        }
    }

    fn action_completed(&mut self, action: &'static str, code: ActionCode) {
        if !code.is_success() {
            return;
        }
        match action {
            "response-handler" => {
                if let Some(plan) = self.plan_sink.borrow().clone() {
                    self.display_version = plan.display_version;
                    self.payload_size = plan.payload_size;
                }
                self.set_status(UpdateStatus::UpdateAvailable);
            }
            "download" => self.set_status(UpdateStatus::Downloading),
            "payload-processor" => self.set_status(UpdateStatus::Finalizing),
            _ => {}
        }
    }

    fn finish_run(&mut self, outcome: ProcessorOutcome) -> ActionCode {
        self.run_abort = None;
        let code = outcome.code;
        match code {
            ActionCode::Success => {
                info!(
                    "Update to {} applied, waiting for reboot",
                    self.display_version
                );
                if let Err(e) = self.conclude_successful_apply() {
                    error!("Post-apply cleanup failed: {}", e);
                }
                self.last_error = None;
                self.set_status(UpdateStatus::UpdatedNeedReboot);
            }
            ActionCode::NoUpdate => {
                self.last_error = None;
                self.set_status(UpdateStatus::Idle);
            }
            ActionCode::Aborted => {
                info!("Update attempt cancelled");
                self.last_error = Some(code);
                self.set_status(UpdateStatus::Idle);
            }
            _ => {
                error!("Update attempt failed in {} with {}", outcome.action, code);
                self.last_error = Some(code);
                if let Err(e) = self.system.prefs.set(LAST_ERROR_KEY, &code.to_string()) {
                    warn!("Could not persist the error code: {}", e);
                }
                self.apply_error_policy(code);
                self.set_status(UpdateStatus::ReportingError);
                self.set_status(UpdateStatus::Idle);
            }
        }
        code
    }

    fn conclude_successful_apply(&mut self) -> crate::error::Result<()> {
        self.system.prefs.remove(RESPONSE_HASH_KEY)?;
        self.system.payload_state.borrow_mut().clear()?;
        self.system.prefs.remove(LAST_ERROR_KEY)?;
        // Remember which boot wrote the slot; a different boot id later
        // proves the reboot into the new image happened.
        self.system.prefs.set(BOOT_ID_KEY, &self.system.boot_id)?;
        Ok(())
    }

    fn apply_error_policy(&mut self, code: ActionCode) {
        match code {
            ActionCode::Network => {
                if let Err(e) = self.system.payload_state.borrow_mut().advance_url() {
                    warn!("Could not advance the payload URL: {}", e);
                }
            }
            ActionCode::PayloadMismatch => {
                // This URL served a damaged payload: forget the partial
                // apply and try the next mirror on the following check.
                let mut store = self.system.prefs.clone();
                if let Err(e) = reset_update_progress(&mut store) {
                    warn!("Could not reset update progress: {}", e);
                }
                if let Err(e) = self.system.payload_state.borrow_mut().advance_url() {
                    warn!("Could not advance the payload URL: {}", e);
                }
            }
            // The processor already invalidated its progress; the stored
            // response hash keeps the next identical response from
            // resuming.
            ActionCode::Hash | ActionCode::Signature => {}
            _ => {}
        }
    }

    /// Deferred idempotent boot-flag commit, scheduled a fixed interval
    /// after process start: the machine came up, so the slot it booted from
    /// deserves to be kept.
    pub fn update_boot_flags(&mut self) {
        if self.boot_flags_updated {
            return;
        }
        if let Some(stored) = self.system.prefs.get(BOOT_ID_KEY) {
            if stored != self.system.boot_id {
                info!("First boot after applying an update");
                if let Err(e) = self.system.prefs.remove(BOOT_ID_KEY) {
                    warn!("Could not clear the stored boot id: {}", e);
                }
            }
        }
        match self.boot_flags.mark_slot_good(&self.system.boot_device) {
            Ok(()) => {
                info!("Marked {} as successfully booted", self.system.boot_device);
                self.boot_flags_updated = true;
            }
            Err(e) => error!("Could not update boot flags: {}", e),
        }
    }
}

/// Runs one complete update attempt on the attempter. Borrows of the
/// attempter are transient; while actions wait on I/O the cell is free for
/// status queries and cancellation.
pub async fn run_update(this: Rc<RefCell<UpdateAttempter>>) -> ActionCode {
    let abort = {
        let mut attempter = this.borrow_mut();
        match attempter.status {
            UpdateStatus::Idle => {}
            UpdateStatus::UpdatedNeedReboot => {
                info!("Update already applied, waiting for reboot");
                return ActionCode::NoUpdate;
            }
            status => {
                warn!("Update check requested while {}", status);
                return ActionCode::NoUpdate;
            }
        }
        let abort = attempter.terminator.run_flag();
        attempter.run_abort = Some(abort.clone());
        attempter.plan_sink.borrow_mut().take();
        attempter.display_version.clear();
        attempter.bytes_written = 0;
        attempter.payload_size = 0;
        attempter.last_percent = u64::MAX;
        attempter.set_status(UpdateStatus::CheckingForUpdate);
        abort
    };

    let mut processor = build_graph(&this, &abort);
    let outcome = processor.start().await;
    this.borrow_mut().finish_run(outcome)
}

fn build_graph(
    this: &Rc<RefCell<UpdateAttempter>>,
    abort: &AbortFlag,
) -> ActionProcessor<'static> {
    let attempter = this.borrow();
    let system = &attempter.system;

    let (response_tx, response_rx) = Pipe::pair();
    let (plan_tx, plan_rx) = Pipe::pair();
    let (stream_tx, stream_rx) = Pipe::pair();
    let (outcome_tx, outcome_rx) = Pipe::pair();
    let (post_tx, post_rx) = Pipe::pair();

    let omaha = OmahaRequestAction::new(
        system.config.server_url.clone(),
        system.machine_id.clone(),
        system.release.version.clone(),
        system.release.board.clone(),
        abort.clone(),
        response_tx,
    );
    let handler = ResponseHandlerAction::new(
        system.prefs.clone(),
        Rc::clone(&system.payload_state),
        system.boot_device.clone(),
        system.boot_dir.clone(),
        response_rx,
        plan_tx,
    )
    .with_plan_sink(Rc::clone(&attempter.plan_sink));
    let download = DownloadAction::new(
        system.prefs.clone(),
        system.config.pinned_certificate.clone(),
        abort.clone(),
        plan_rx,
        stream_tx,
    );
    let progress_this = Rc::clone(this);
    let verifying_this = Rc::clone(this);
    let payload = PayloadProcessorAction::new(
        system.prefs.clone(),
        system.config.public_key_path.clone(),
        abort.clone(),
        stream_rx,
        outcome_tx,
    )
    .on_progress(Rc::new(move |bytes, total| {
        progress_this.borrow_mut().report_progress(bytes, total);
    }))
    .on_verifying(Rc::new(move || {
        verifying_this.borrow_mut().set_status(UpdateStatus::Verifying);
    }));
    let postinstall = PostinstallRunnerAction::new(
        Rc::clone(&attempter.postinstall),
        abort.clone(),
        outcome_rx,
        post_tx,
    );
    let marker = BootableMarkerAction::new(Rc::clone(&attempter.boot_flags), abort.clone(), post_rx);

    let mut processor = ActionProcessor::new(abort.clone());
    processor.enqueue(Box::new(omaha));
    processor.enqueue(Box::new(handler));
    processor.enqueue(Box::new(download));
    processor.enqueue(Box::new(payload));
    processor.enqueue(Box::new(postinstall));
    processor.enqueue(Box::new(marker));

    let hook_this = Rc::clone(this);
    processor.on_complete(move |name, code| {
        hook_this.borrow_mut().action_completed(name, code);
    });
    processor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::payload_state::PayloadState;
    use crate::prefs::{Prefs, PrefsHandle};
    use crate::system_state::ReleaseInfo;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use update_payload::{NEXT_OPERATION_KEY, SHA256_CONTEXT_KEY};

    #[derive(Default)]
    struct RecordingFlags {
        next_boot: RefCell<Vec<String>>,
        good: RefCell<Vec<String>>,
    }

    impl BootFlagClient for RecordingFlags {
        fn set_next_boot(&self, partition: &str) -> Result<(), bootslot::Error> {
            self.next_boot.borrow_mut().push(partition.to_string());
            Ok(())
        }

        fn mark_slot_good(&self, partition: &str) -> Result<(), bootslot::Error> {
            self.good.borrow_mut().push(partition.to_string());
            Ok(())
        }
    }

    struct NoopPostinstall;

    #[async_trait(?Send)]
    impl PostinstallExecutor for NoopPostinstall {
        async fn run(&self, _new_partition: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct RecordingObserver(Rc<RefCell<Vec<UpdateStatus>>>);

    impl StatusObserver for RecordingObserver {
        fn on_status(&self, snapshot: &StatusSnapshot) {
            self.0.borrow_mut().push(snapshot.status);
        }
    }

    struct Fixture {
        _prefs_dir: TempDir,
        prefs: PrefsHandle,
        flags: Rc<RecordingFlags>,
        attempter: UpdateAttempter,
        statuses: Rc<RefCell<Vec<UpdateStatus>>>,
    }

    fn fixture() -> Fixture {
        let prefs_dir = TempDir::new().unwrap();
        let prefs = PrefsHandle::new(Prefs::open(prefs_dir.path()).unwrap());
        let payload_state = Rc::new(RefCell::new(PayloadState::load(prefs.clone())));
        let system = SystemState {
            config: Config::default(),
            prefs: prefs.clone(),
            payload_state,
            boot_device: "/dev/sda3".to_string(),
            boot_dir: PathBuf::from("/boot"),
            boot_id: "boot-1".to_string(),
            release: ReleaseInfo {
                version: "1124.0.0".to_string(),
                board: "amd64-usr".to_string(),
            },
            machine_id: "machine".to_string(),
        };
        let flags = Rc::new(RecordingFlags::default());
        let (terminator, _wake) = Terminator::noop();
        let mut attempter = UpdateAttempter::new(
            system,
            Rc::clone(&flags) as _,
            Rc::new(NoopPostinstall),
            terminator,
        );
        let statuses = Rc::new(RefCell::new(Vec::new()));
        attempter.add_observer(Box::new(RecordingObserver(Rc::clone(&statuses))));
        Fixture {
            _prefs_dir: prefs_dir,
            prefs,
            flags,
            attempter,
            statuses,
        }
    }

    fn outcome(action: &'static str, code: ActionCode) -> ProcessorOutcome {
        ProcessorOutcome { action, code }
    }

    #[test]
    fn successful_apply_cleans_up_and_waits_for_reboot() {
        let mut f = fixture();
        f.prefs.set(RESPONSE_HASH_KEY, "HASH").unwrap();
        f.attempter
            .system
            .payload_state
            .borrow_mut()
            .advance_url()
            .unwrap();

        let code = f
            .attempter
            .finish_run(outcome("bootable-marker", ActionCode::Success));
        assert_eq!(code, ActionCode::Success);
        assert_eq!(f.attempter.status(), UpdateStatus::UpdatedNeedReboot);
        assert_eq!(f.prefs.get(RESPONSE_HASH_KEY), None);
        assert_eq!(f.prefs.get(BOOT_ID_KEY).as_deref(), Some("boot-1"));
        assert_eq!(f.attempter.system.payload_state.borrow().url_index(), 0);
    }

    #[test]
    fn network_failure_advances_the_url_rotation() {
        let mut f = fixture();
        let code = f.attempter.finish_run(outcome("download", ActionCode::Network));
        assert_eq!(code, ActionCode::Network);
        assert_eq!(f.attempter.status(), UpdateStatus::Idle);
        assert_eq!(f.attempter.last_error(), Some(ActionCode::Network));
        assert_eq!(f.attempter.system.payload_state.borrow().url_index(), 1);
        assert_eq!(f.prefs.get("last-error-code").as_deref(), Some("network"));
        assert_eq!(
            *f.statuses.borrow(),
            vec![UpdateStatus::ReportingError, UpdateStatus::Idle]
        );
    }

    #[test]
    fn damaged_payload_resets_progress_and_advances_url() {
        let mut f = fixture();
        f.prefs.set(RESPONSE_HASH_KEY, "HASH").unwrap();
        f.prefs.set(NEXT_OPERATION_KEY, "4").unwrap();
        f.prefs.set(SHA256_CONTEXT_KEY, "aa").unwrap();

        f.attempter
            .finish_run(outcome("payload-processor", ActionCode::PayloadMismatch));
        assert_eq!(f.prefs.get(NEXT_OPERATION_KEY), None);
        assert_eq!(f.prefs.get(SHA256_CONTEXT_KEY), None);
        // The response hash survives so the next response restarts cleanly.
        assert_eq!(f.prefs.get(RESPONSE_HASH_KEY).as_deref(), Some("HASH"));
        assert_eq!(f.attempter.system.payload_state.borrow().url_index(), 1);
    }

    #[test]
    fn no_update_goes_straight_back_to_idle() {
        let mut f = fixture();
        f.attempter
            .finish_run(outcome("response-handler", ActionCode::NoUpdate));
        assert_eq!(f.attempter.status(), UpdateStatus::Idle);
        assert_eq!(f.attempter.last_error(), None);
        assert_eq!(*f.statuses.borrow(), vec![UpdateStatus::Idle]);
    }

    #[test]
    fn boot_flags_commit_is_deferred_and_idempotent() {
        let mut f = fixture();
        // A previous run applied an update during boot id "boot-0".
        f.prefs.set(BOOT_ID_KEY, "boot-0").unwrap();

        f.attempter.update_boot_flags();
        f.attempter.update_boot_flags();
        assert_eq!(*f.flags.good.borrow(), vec!["/dev/sda3"]);
        assert_eq!(f.prefs.get(BOOT_ID_KEY), None);
        assert!(f.flags.next_boot.borrow().is_empty());
    }
}
