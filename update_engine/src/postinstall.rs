//! Runs the postinstall tool shipped inside the freshly written image,
//! under subprocess supervision with a hard timeout.

use crate::action::{Action, ActionCode, AbortFlag, Pipe};
use crate::error::{self, Result};
use crate::install_plan::InstallOutcome;
use crate::subprocess;
use async_trait::async_trait;
use log::{error, info, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use snafu::{ensure, ResultExt};
use std::time::Duration;

const POSTINSTALL_TOOL: &str = "postinst";

/// The mount-and-exec seam, a trait so tests can substitute the executor.
#[async_trait(?Send)]
pub trait PostinstallExecutor {
    async fn run(&self, new_partition: &str) -> Result<()>;
}

/// Mounts the new partition read-only and runs `postinst <install-device>`
/// from it.
pub struct MountedPostinstall {
    timeout: Duration,
}

impl MountedPostinstall {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait(?Send)]
impl PostinstallExecutor for MountedPostinstall {
    async fn run(&self, new_partition: &str) -> Result<()> {
        let mount_point = tempfile::tempdir().context(error::MountPointSnafu)?;
        mount(
            Some(new_partition),
            mount_point.path(),
            Some("ext4"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .context(error::MountSnafu {
            device: new_partition,
            target: mount_point.path(),
        })?;

        let result = async {
            let tool = mount_point.path().join(POSTINSTALL_TOOL);
            ensure!(
                tool.exists(),
                error::PostinstallMissingSnafu {
                    device: new_partition,
                }
            );
            info!("Running {} {}", tool.display(), new_partition);
            let output = subprocess::run_checked(&tool, [new_partition], self.timeout).await?;
            if !output.stdout.is_empty() {
                info!(
                    "postinst: {}",
                    String::from_utf8_lossy(&output.stdout).trim_end()
                );
            }
            Ok(())
        }
        .await;

        if let Err(e) = umount2(mount_point.path(), MntFlags::MNT_DETACH) {
            warn!("Failed to unmount {}: {}", mount_point.path().display(), e);
        }
        result
    }
}

pub struct PostinstallRunnerAction {
    executor: std::rc::Rc<dyn PostinstallExecutor>,
    abort: AbortFlag,
    input: Pipe<InstallOutcome>,
    output: Pipe<InstallOutcome>,
}

impl PostinstallRunnerAction {
    pub fn new(
        executor: std::rc::Rc<dyn PostinstallExecutor>,
        abort: AbortFlag,
        input: Pipe<InstallOutcome>,
        output: Pipe<InstallOutcome>,
    ) -> Self {
        Self {
            executor,
            abort,
            input,
            output,
        }
    }
}

#[async_trait(?Send)]
impl Action for PostinstallRunnerAction {
    fn name(&self) -> &'static str {
        "postinstall-runner"
    }

    async fn perform(&mut self) -> ActionCode {
        let Some(outcome) = self.input.take() else {
            return ActionCode::Internal;
        };
        if self.abort.is_aborted() {
            return ActionCode::Aborted;
        }
        if let Err(e) = self.executor.run(&outcome.plan.new_partition_path).await {
            error!("Postinstall failed: {}", e);
            return ActionCode::Io;
        }
        self.output.put(outcome);
        ActionCode::Success
    }
}
