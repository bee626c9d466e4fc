//! Terminal-state reconciliation for agent callbacks.
//!
//! Agents deliver results at-least-once, so everything here must be
//! idempotent: an unknown execution is dropped without creating state, a
//! report against an already-terminal execution is acknowledged without
//! mutation, and the terminal write itself is conditional so a racing
//! timeout monitor and callback resolve to a single winner.

use tracing::{info, instrument, warn};

use cirrus_common::{Error, ExecutionStatus, Result, ResultReport};
use cirrus_state::StateStore;

#[derive(Clone)]
pub struct ResultReconciler {
    state: StateStore,
}

impl ResultReconciler {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Apply a completion report. Persistence failures propagate so the
    /// caller can answer 5xx and the agent retries.
    #[instrument(skip(self, report), fields(request_id = %report.request_id))]
    pub async fn receive_result(&self, report: &ResultReport) -> Result<()> {
        let Some(execution) = self.state.get_execution(&report.request_id).await? else {
            warn!("Result for unknown execution, dropping");
            return Err(Error::ExecutionNotFound(report.request_id.clone()));
        };

        let status: ExecutionStatus = execution.status.parse()?;
        if status.is_terminal() {
            info!(status = %status, "Execution already terminal, duplicate report is a no-op");
            return Ok(());
        }

        let (terminal, output, error) = if report.status_code == 200 {
            (
                ExecutionStatus::Completed,
                Some(report.output.as_str()),
                None,
            )
        } else {
            (
                ExecutionStatus::Failed,
                (!report.output.is_empty()).then_some(report.output.as_str()),
                report
                    .error_message
                    .as_deref()
                    .or(Some("agent reported failure")),
            )
        };

        let applied = self
            .state
            .finalize_execution(&report.request_id, terminal, output, error)
            .await?;
        if applied {
            info!(status = %terminal, "Recorded execution result");
        } else {
            info!("Lost finalisation race, report is a no-op");
        }
        Ok(())
    }
}
