//! The head of the action graph: asks the update server whether a newer
//! image exists. The server's wire format is owned by the server team; this
//! adapter stays thin and surfaces anything unexpected as a network
//! failure.

use crate::action::{Action, ActionCode, AbortFlag, Pipe};
use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed server reply. When `update_exists` is set, the URL list, size,
/// and hash are all present and non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateResponse {
    pub update_exists: bool,
    #[serde(default)]
    pub display_version: String,
    #[serde(default)]
    pub payload_urls: Vec<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
}

impl UpdateResponse {
    /// The §3 invariant: an offered update names its payload completely.
    fn is_complete(&self) -> bool {
        !self.update_exists
            || (!self.payload_urls.is_empty() && self.size > 0 && !self.hash.is_empty())
    }
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    machine_id: &'a str,
    version: &'a str,
    board: &'a str,
}

pub struct OmahaRequestAction {
    server_url: String,
    machine_id: String,
    version: String,
    board: String,
    abort: AbortFlag,
    output: Pipe<UpdateResponse>,
}

impl OmahaRequestAction {
    pub fn new(
        server_url: String,
        machine_id: String,
        version: String,
        board: String,
        abort: AbortFlag,
        output: Pipe<UpdateResponse>,
    ) -> Self {
        Self {
            server_url,
            machine_id,
            version,
            board,
            abort,
            output,
        }
    }
}

#[async_trait(?Send)]
impl Action for OmahaRequestAction {
    fn name(&self) -> &'static str {
        "omaha-request"
    }

    async fn perform(&mut self) -> ActionCode {
        if self.abort.is_aborted() {
            return ActionCode::Aborted;
        }
        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to build HTTP client: {}", e);
                return ActionCode::Internal;
            }
        };
        let request = CheckRequest {
            machine_id: &self.machine_id,
            version: &self.version,
            board: &self.board,
        };
        info!("Checking {} for an update", self.server_url);
        let response = match client.post(&self.server_url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Update check failed: {}", e);
                return ActionCode::Network;
            }
        };
        if !response.status().is_success() {
            warn!("Update server answered {}", response.status());
            return ActionCode::Network;
        }
        let parsed: UpdateResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable update response: {}", e);
                return ActionCode::Network;
            }
        };
        if !parsed.is_complete() {
            warn!("Update response offers an update but is missing fields");
            return ActionCode::Network;
        }
        self.output.put(parsed);
        ActionCode::Success
    }
}
