//! Opens the payload byte stream: a ranged HTTP(S) fetch with optional TLS
//! root pinning. The body is handed downstream unconsumed, so the payload
//! processor applies bytes as they arrive.

use crate::action::{Action, ActionCode, AbortFlag, Pipe};
use crate::install_plan::InstallPlan;
use crate::prefs::PrefsHandle;
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::header::RANGE;
use reqwest::{Certificate, Client, StatusCode};
use std::error::Error as StdError;
use std::fs;
use std::path::PathBuf;
use update_payload::NEXT_DATA_OFFSET_KEY;
use url::Url;

/// The downloader's product: the plan it fetched for plus the open,
/// not-yet-consumed response body. A lazy byte sequence, transferred by the
/// pipe as a capability.
pub struct PayloadStream {
    pub plan: InstallPlan,
    /// The offset the engine asked the server to resume from.
    pub resume_offset: u64,
    /// The offset the stream actually starts at (zero when the server
    /// ignored the range request).
    pub stream_start: u64,
    pub response: reqwest::Response,
}

pub struct DownloadAction {
    prefs: PrefsHandle,
    pinned_certificate: Option<PathBuf>,
    abort: AbortFlag,
    input: Pipe<InstallPlan>,
    output: Pipe<PayloadStream>,
}

impl DownloadAction {
    pub fn new(
        prefs: PrefsHandle,
        pinned_certificate: Option<PathBuf>,
        abort: AbortFlag,
        input: Pipe<InstallPlan>,
        output: Pipe<PayloadStream>,
    ) -> Self {
        Self {
            prefs,
            pinned_certificate,
            abort,
            input,
            output,
        }
    }

    fn build_client(&self) -> Result<Client, ActionCode> {
        let mut builder = Client::builder();
        if let Some(path) = &self.pinned_certificate {
            let pem = fs::read(path).map_err(|e| {
                error!("Cannot read pinned certificate {}: {}", path.display(), e);
                ActionCode::Security
            })?;
            let certificate = Certificate::from_pem(&pem).map_err(|e| {
                error!("Cannot parse pinned certificate {}: {}", path.display(), e);
                ActionCode::Security
            })?;
            // Only chains descending from the pinned root are acceptable.
            builder = builder
                .add_root_certificate(certificate)
                .tls_built_in_root_certs(false);
        }
        builder.build().map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            ActionCode::Internal
        })
    }
}

/// Distinguishes a rejected certificate from ordinary transport trouble by
/// walking the error's source chain.
fn classify_transport_error(e: &reqwest::Error) -> ActionCode {
    let mut source: Option<&dyn StdError> = Some(e);
    while let Some(current) = source {
        if current.to_string().to_ascii_lowercase().contains("certificate") {
            return ActionCode::Security;
        }
        source = current.source();
    }
    ActionCode::Network
}

#[async_trait(?Send)]
impl Action for DownloadAction {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn perform(&mut self) -> ActionCode {
        let Some(plan) = self.input.take() else {
            return ActionCode::Internal;
        };
        if self.abort.is_aborted() {
            return ActionCode::Aborted;
        }
        if let Err(e) = Url::parse(&plan.download_url) {
            warn!("Malformed payload URL '{}': {}", plan.download_url, e);
            return ActionCode::Network;
        }

        let resume_offset = if plan.is_resume {
            self.prefs
                .get(NEXT_DATA_OFFSET_KEY)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        } else {
            0
        };

        let client = match self.build_client() {
            Ok(client) => client,
            Err(code) => return code,
        };
        let mut request = client.get(&plan.download_url);
        if resume_offset > 0 {
            info!(
                "Resuming download of {} at offset {}",
                plan.download_url, resume_offset
            );
            request = request.header(RANGE, format!("bytes={}-", resume_offset));
        } else {
            info!("Downloading {}", plan.download_url);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let code = classify_transport_error(&e);
                warn!("Download failed: {}", e);
                return code;
            }
        };
        if !response.status().is_success() {
            warn!(
                "Server answered {} for {}",
                response.status(),
                plan.download_url
            );
            return ActionCode::Network;
        }
        let stream_start = if response.status() == StatusCode::PARTIAL_CONTENT {
            resume_offset
        } else {
            if resume_offset > 0 {
                info!("Server ignored the range request, restarting from zero");
            }
            0
        };
        if let Some(length) = response.content_length() {
            let expected = plan.payload_size.saturating_sub(stream_start);
            if length != expected {
                warn!(
                    "Server offers {} bytes where the response promised {}",
                    length, expected
                );
                return ActionCode::Network;
            }
        }

        self.output.put(PayloadStream {
            plan,
            resume_offset,
            stream_start,
            response,
        });
        ActionCode::Success
    }
}
