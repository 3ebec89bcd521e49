use log::info;

/// The fully-resolved description of one apply attempt: the sole contract
/// between deciding what to install and applying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub is_resume: bool,
    pub download_url: String,
    pub payload_size: u64,
    /// Hex SHA-256 of the payload, from the server response.
    pub payload_hash: String,
    pub display_version: String,
    pub old_partition_path: String,
    pub new_partition_path: String,
    pub old_kernel_path: String,
    pub new_kernel_path: String,
    pub pcr_policy_path: String,
}

impl InstallPlan {
    pub fn dump(&self) {
        info!("Using this install plan:");
        info!("  url: {}", self.download_url);
        info!("  version: {}", self.display_version);
        info!("  size: {}", self.payload_size);
        info!("  resume: {}", self.is_resume);
        info!(
            "  partition: {} -> {}",
            self.old_partition_path, self.new_partition_path
        );
        info!(
            "  kernel: {} -> {}",
            self.old_kernel_path, self.new_kernel_path
        );
        info!("  pcr policy: {}", self.pcr_policy_path);
    }
}

/// What a verified apply hands to the finalize stages: the plan it ran
/// under, plus artifacts extracted from the payload.
#[derive(Debug)]
pub struct InstallOutcome {
    pub plan: InstallPlan,
    pub version_label: String,
    pub pcr_policy: Option<Vec<u8>>,
}
