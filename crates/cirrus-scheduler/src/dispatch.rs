//! HTTP client for the in-VM agent, behind a trait so tests can stand in a
//! fake agent.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use cirrus_common::{DispatchPayload, Error, Result, AGENT_PORT};

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Deliver a payload to the agent on `vm_ip`. Success means the agent
    /// accepted the work (202); the result arrives out-of-band.
    async fn dispatch(
        &self,
        vm_ip: &str,
        payload: &DispatchPayload,
        timeout: Duration,
    ) -> Result<()>;
}

pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn dispatch(
        &self,
        vm_ip: &str,
        payload: &DispatchPayload,
        timeout: Duration,
    ) -> Result<()> {
        let url = format!("http://{vm_ip}:{AGENT_PORT}/execute");
        info!(%url, request_id = %payload.request_id, "Dispatching to agent");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::DispatchFailed(format!("agent unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::DispatchFailed(format!(
                "agent rejected dispatch with {}",
                response.status()
            )));
        }
        Ok(())
    }
}
