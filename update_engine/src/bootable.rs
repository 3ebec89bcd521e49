//! The terminal action of an attempt: install the PCR policy the payload
//! staged and ask the bootloader to try the new slot on the next boot. The
//! slot is deliberately not marked good here; that happens after the next
//! boot proves out.

use crate::action::{Action, ActionCode, AbortFlag, Pipe};
use crate::error::{self, Result};
use crate::install_plan::InstallOutcome;
use async_trait::async_trait;
use bootslot::BootFlagClient;
use log::{error, info};
use snafu::ResultExt;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use tempfile::NamedTempFile;

pub struct BootableMarkerAction {
    boot_flags: Rc<dyn BootFlagClient>,
    abort: AbortFlag,
    input: Pipe<InstallOutcome>,
}

impl BootableMarkerAction {
    pub fn new(
        boot_flags: Rc<dyn BootFlagClient>,
        abort: AbortFlag,
        input: Pipe<InstallOutcome>,
    ) -> Self {
        Self {
            boot_flags,
            abort,
            input,
        }
    }
}

fn write_pcr_policy(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(error::PcrPolicyWriteSnafu { path })?;
        let mut temp =
            NamedTempFile::new_in(parent).context(error::PcrPolicyWriteSnafu { path })?;
        temp.write_all(bytes)
            .context(error::PcrPolicyWriteSnafu { path })?;
        temp.persist(path)
            .context(error::PcrPolicyPersistSnafu { path })?;
    }
    Ok(())
}

#[async_trait(?Send)]
impl Action for BootableMarkerAction {
    fn name(&self) -> &'static str {
        "bootable-marker"
    }

    async fn perform(&mut self) -> ActionCode {
        let Some(outcome) = self.input.take() else {
            return ActionCode::Internal;
        };
        if self.abort.is_aborted() {
            return ActionCode::Aborted;
        }

        if let Some(policy) = &outcome.pcr_policy {
            if let Err(e) = write_pcr_policy(Path::new(&outcome.plan.pcr_policy_path), policy) {
                error!("{}", e);
                return ActionCode::Io;
            }
            info!("Installed PCR policy at {}", outcome.plan.pcr_policy_path);
        }

        if let Err(e) = self
            .boot_flags
            .set_next_boot(&outcome.plan.new_partition_path)
        {
            error!("Could not mark the new slot for boot: {}", e);
            return ActionCode::Io;
        }
        info!(
            "Slot {} will be tried on the next boot",
            outcome.plan.new_partition_path
        );
        ActionCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::FeederAction;
    use crate::action::ActionProcessor;
    use crate::install_plan::InstallPlan;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingFlags {
        next_boot: RefCell<Vec<String>>,
        good: RefCell<Vec<String>>,
    }

    impl BootFlagClient for RecordingFlags {
        fn set_next_boot(&self, partition: &str) -> std::result::Result<(), bootslot::Error> {
            self.next_boot.borrow_mut().push(partition.to_string());
            Ok(())
        }

        fn mark_slot_good(&self, partition: &str) -> std::result::Result<(), bootslot::Error> {
            self.good.borrow_mut().push(partition.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn installs_policy_and_requests_next_boot() {
        let dir = TempDir::new().unwrap();
        let policy_path = dir.path().join("state/pcrs-b.zip");
        let flags = Rc::new(RecordingFlags::default());

        let outcome = InstallOutcome {
            plan: InstallPlan {
                new_partition_path: "/dev/sda4".to_string(),
                pcr_policy_path: policy_path.display().to_string(),
                ..Default::default()
            },
            version_label: "1124.1.0".to_string(),
            pcr_policy: Some(b"policy".to_vec()),
        };

        let (in_tx, in_rx) = Pipe::pair();
        let feeder = FeederAction::new(outcome, in_tx);
        let action = BootableMarkerAction::new(Rc::clone(&flags) as _, AbortFlag::new(), in_rx);

        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(feeder));
        processor.enqueue(Box::new(action));
        let result = processor.start().await;

        assert_eq!(result.code, ActionCode::Success);
        assert_eq!(std::fs::read(&policy_path).unwrap(), b"policy");
        assert_eq!(*flags.next_boot.borrow(), vec!["/dev/sda4"]);
        assert!(flags.good.borrow().is_empty(), "slot must not be marked good yet");
    }

    #[tokio::test]
    async fn missing_policy_is_not_an_error() {
        let flags = Rc::new(RecordingFlags::default());
        let outcome = InstallOutcome {
            plan: InstallPlan {
                new_partition_path: "/dev/sda3".to_string(),
                pcr_policy_path: "/nonexistent/pcrs-a.zip".to_string(),
                ..Default::default()
            },
            version_label: "1124.1.0".to_string(),
            pcr_policy: None,
        };

        let (in_tx, in_rx) = Pipe::pair();
        let feeder = FeederAction::new(outcome, in_tx);
        let action = BootableMarkerAction::new(Rc::clone(&flags) as _, AbortFlag::new(), in_rx);

        let mut processor = ActionProcessor::new(AbortFlag::new());
        processor.enqueue(Box::new(feeder));
        processor.enqueue(Box::new(action));
        let result = processor.start().await;

        assert_eq!(result.code, ActionCode::Success);
        assert_eq!(*flags.next_boot.borrow(), vec!["/dev/sda3"]);
    }
}
