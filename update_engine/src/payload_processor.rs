//! Drives the streaming payload apply: pulls chunks from the downloader's
//! lazy byte stream, feeds them to the payload processor, and maps its
//! failures onto action codes.

use crate::action::{Action, ActionCode, AbortFlag, Pipe};
use crate::download::PayloadStream;
use crate::install_plan::InstallOutcome;
use crate::prefs::PrefsHandle;
use async_trait::async_trait;
use log::{error, warn};
use std::path::PathBuf;
use std::rc::Rc;
use update_payload::{ErrorKind, PayloadProcessor, ProcessorConfig};

/// Progress callback: (bytes processed, payload size).
pub type ProgressHook = Rc<dyn Fn(u64, u64)>;
/// Invoked when the stream is complete and final verification begins.
pub type VerifyingHook = Rc<dyn Fn()>;

pub struct PayloadProcessorAction {
    prefs: PrefsHandle,
    public_key: PathBuf,
    abort: AbortFlag,
    on_progress: Option<ProgressHook>,
    on_verifying: Option<VerifyingHook>,
    input: Pipe<PayloadStream>,
    output: Pipe<InstallOutcome>,
}

impl PayloadProcessorAction {
    pub fn new(
        prefs: PrefsHandle,
        public_key: PathBuf,
        abort: AbortFlag,
        input: Pipe<PayloadStream>,
        output: Pipe<InstallOutcome>,
    ) -> Self {
        Self {
            prefs,
            public_key,
            abort,
            on_progress: None,
            on_verifying: None,
            input,
            output,
        }
    }

    pub fn on_progress(mut self, hook: ProgressHook) -> Self {
        self.on_progress = Some(hook);
        self
    }

    pub fn on_verifying(mut self, hook: VerifyingHook) -> Self {
        self.on_verifying = Some(hook);
        self
    }
}

fn map_payload_error(e: &update_payload::Error) -> ActionCode {
    match e.kind() {
        ErrorKind::Hash => ActionCode::Hash,
        ErrorKind::Signature => ActionCode::Signature,
        ErrorKind::PayloadMismatch => ActionCode::PayloadMismatch,
        ErrorKind::Io => ActionCode::Io,
        ErrorKind::Internal => ActionCode::Internal,
    }
}

#[async_trait(?Send)]
impl Action for PayloadProcessorAction {
    fn name(&self) -> &'static str {
        "payload-processor"
    }

    async fn perform(&mut self) -> ActionCode {
        let Some(stream) = self.input.take() else {
            return ActionCode::Internal;
        };
        let plan = stream.plan.clone();
        let config = ProcessorConfig {
            old_partition: PathBuf::from(&plan.old_partition_path),
            new_partition: PathBuf::from(&plan.new_partition_path),
            old_kernel: PathBuf::from(&plan.old_kernel_path),
            new_kernel: PathBuf::from(&plan.new_kernel_path),
            payload_size: plan.payload_size,
            payload_hash: plan.payload_hash.clone(),
            public_key: self.public_key.clone(),
        };
        let mut processor = PayloadProcessor::new(Box::new(self.prefs.clone()), config);

        match processor.start(plan.is_resume) {
            Ok(offset) if offset != stream.resume_offset => {
                error!(
                    "Processor resumes at {} but the download was opened at {}",
                    offset, stream.resume_offset
                );
                return ActionCode::Internal;
            }
            Ok(_) => {}
            Err(e) => {
                error!("{}", e);
                return map_payload_error(&e);
            }
        }
        if let Err(e) = processor.set_stream_start(stream.stream_start) {
            error!("{}", e);
            return map_payload_error(&e);
        }

        let mut response = stream.response;
        loop {
            if self.abort.is_aborted() {
                return ActionCode::Aborted;
            }
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = processor.write(&chunk) {
                        error!("{}", e);
                        return map_payload_error(&e);
                    }
                    if let Some(hook) = &self.on_progress {
                        hook(processor.bytes_processed(), plan.payload_size);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Transfer interrupted: {}", e);
                    return ActionCode::Network;
                }
            }
        }

        if let Some(hook) = &self.on_verifying {
            hook();
        }
        match processor.finish() {
            Ok(result) => {
                self.output.put(InstallOutcome {
                    plan,
                    version_label: result.version_label,
                    pcr_policy: result.pcr_policy,
                });
                ActionCode::Success
            }
            Err(e) => {
                error!("{}", e);
                map_payload_error(&e)
            }
        }
    }
}
