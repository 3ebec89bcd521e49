//! Turns a server response into an install plan: picks the download URL
//! from the rotation, resolves the slot and kernel paths for the inactive
//! side, and decides whether persisted progress allows a resume.

use crate::action::{Action, ActionCode, Pipe};
use crate::install_plan::InstallPlan;
use crate::omaha_request::UpdateResponse;
use crate::payload_state::PayloadState;
use crate::prefs::PrefsHandle;
use async_trait::async_trait;
use log::{error, info, warn};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use update_payload::{can_resume_update, reset_update_progress, RESPONSE_HASH_KEY};

pub struct ResponseHandlerAction {
    prefs: PrefsHandle,
    payload_state: Rc<RefCell<PayloadState>>,
    boot_device: String,
    boot_dir: PathBuf,
    input: Pipe<UpdateResponse>,
    output: Pipe<InstallPlan>,
    /// Where the attempter watches the resolved plan, for its status
    /// broadcasts.
    plan_sink: Option<Rc<RefCell<Option<InstallPlan>>>>,
}

impl ResponseHandlerAction {
    pub fn new(
        prefs: PrefsHandle,
        payload_state: Rc<RefCell<PayloadState>>,
        boot_device: String,
        boot_dir: PathBuf,
        input: Pipe<UpdateResponse>,
        output: Pipe<InstallPlan>,
    ) -> Self {
        Self {
            prefs,
            payload_state,
            boot_device,
            boot_dir,
            input,
            output,
            plan_sink: None,
        }
    }

    pub fn with_plan_sink(mut self, sink: Rc<RefCell<Option<InstallPlan>>>) -> Self {
        self.plan_sink = Some(sink);
        self
    }
}

#[async_trait(?Send)]
impl Action for ResponseHandlerAction {
    fn name(&self) -> &'static str {
        "response-handler"
    }

    async fn perform(&mut self) -> ActionCode {
        let Some(response) = self.input.take() else {
            return ActionCode::Internal;
        };
        if !response.update_exists {
            info!("There are no updates. Aborting.");
            return ActionCode::NoUpdate;
        }

        if let Err(e) = self
            .payload_state
            .borrow_mut()
            .observe_response(&response.hash)
        {
            error!("Failed to persist payload state: {}", e);
            return ActionCode::Io;
        }

        let is_resume = can_resume_update(&self.prefs, &response.hash);
        if !is_resume {
            let mut store = self.prefs.clone();
            if let Err(e) = reset_update_progress(&mut store) {
                error!("Unable to reset the update progress: {}", e);
                return ActionCode::Io;
            }
            if let Err(e) = self.prefs.set(RESPONSE_HASH_KEY, &response.hash) {
                error!("Unable to save the update check response hash: {}", e);
                return ActionCode::Io;
            }
        }

        let url_index = self.payload_state.borrow().url_index() as usize;
        if url_index >= response.payload_urls.len() {
            warn!(
                "URL rotation exhausted ({} past {} urls), backing off",
                url_index,
                response.payload_urls.len()
            );
            return ActionCode::Network;
        }
        info!("Using Url{} as the download url this time", url_index);

        let mut plan = InstallPlan {
            is_resume,
            download_url: response.payload_urls[url_index].clone(),
            payload_size: response.size,
            payload_hash: response.hash.clone(),
            display_version: response.display_version.clone(),
            old_partition_path: self.boot_device.clone(),
            ..Default::default()
        };

        plan.new_partition_path = match bootslot::install_device(&plan.old_partition_path) {
            Ok(device) => device,
            Err(e) => {
                error!("Cannot derive the install partition: {}", e);
                return ActionCode::Internal;
            }
        };
        let kernel = |partition: &str| bootslot::kernel_path_under(&self.boot_dir, partition);
        plan.old_kernel_path = match kernel(&plan.old_partition_path) {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                error!("Cannot derive the old kernel path: {}", e);
                return ActionCode::Internal;
            }
        };
        plan.new_kernel_path = match kernel(&plan.new_partition_path) {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                error!("Cannot derive the new kernel path: {}", e);
                return ActionCode::Internal;
            }
        };
        plan.pcr_policy_path = match bootslot::pcr_policy_path(&plan.new_partition_path) {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                error!("Cannot derive the PCR policy path: {}", e);
                return ActionCode::Internal;
            }
        };

        plan.dump();
        if let Some(sink) = &self.plan_sink {
            *sink.borrow_mut() = Some(plan.clone());
        }
        self.output.put(plan);
        ActionCode::Success
    }
}
