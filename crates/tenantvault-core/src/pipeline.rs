//! The provisioning pipeline.
//!
//! [`Orchestrator`] runs one tenant onboarding end to end:
//!
//! ```text
//! master key ──► EncryptionContext
//!                      │
//! CapacityGate ──► decision ──► ProvisioningInvoker ──► result
//!                                                         │
//!                         CredentialRecorder ◄── records ◄┘
//! ```
//!
//! Every stage fails fast. A failure before recording leaves the mapping
//! store untouched. Infrastructure already applied by the tool is never
//! rolled back.

use tracing::{info, warn};

use crate::capacity::{CapacityGate, ProvisioningDecision};
use crate::error::PipelineError;
use crate::provisioning::{ChangeSummary, ProvisioningInvoker, ProvisioningParameters, ProvisioningTarget};
use crate::recorder::{BatchReport, CredentialRecorder, PlaintextFallback, build_records};
use crate::vault::EncryptionContext;

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// The capacity decision the run acted on.
    pub decision: ProvisioningDecision,
    /// Resource changes reported by the apply, if any.
    pub changes: Option<ChangeSummary>,
    /// What the recorder wrote.
    pub batch: BatchReport,
}

/// Composition root for one provisioning run.
#[derive(Debug)]
pub struct Orchestrator {
    gate: CapacityGate,
    invoker: ProvisioningInvoker,
    recorder: CredentialRecorder,
    target: ProvisioningTarget,
}

impl Orchestrator {
    /// Assemble a pipeline from its stages.
    #[must_use]
    pub fn new(
        gate: CapacityGate,
        invoker: ProvisioningInvoker,
        recorder: CredentialRecorder,
        target: ProvisioningTarget,
    ) -> Self {
        Self {
            gate,
            invoker,
            recorder,
            target,
        }
    }

    /// Run capacity check, provisioning and recording.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] tagged with the first stage that failed.
    pub async fn run(&self, master_key_base64: &str) -> Result<RunReport, PipelineError> {
        let ctx = self.encryption_context(master_key_base64)?;

        let decision = self.gate.evaluate(&self.target.source_project_id).await?;
        let params = ProvisioningParameters::new(&self.target, decision.create_new)?;

        let (receipt, result) = self.invoker.provision(&params).await?;
        let records = build_records(result);
        info!(records = records.len(), "provisioning outputs parsed");

        let batch = self.recorder.persist(records, ctx.as_ref()).await?;
        Ok(RunReport {
            decision,
            changes: receipt.changes(),
            batch,
        })
    }

    /// Validate the master key and evaluate capacity without provisioning.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] from encryption setup, the capacity
    /// check, or parameter validation.
    pub async fn check(&self, master_key_base64: &str) -> Result<ProvisioningDecision, PipelineError> {
        self.encryption_context(master_key_base64)?;
        let decision = self.gate.evaluate(&self.target.source_project_id).await?;
        ProvisioningParameters::new(&self.target, decision.create_new)?;
        Ok(decision)
    }

    /// Build the run's encryption context, applying the fallback policy.
    fn encryption_context(&self, master_key_base64: &str) -> Result<Option<EncryptionContext>, PipelineError> {
        match EncryptionContext::initialize(master_key_base64) {
            Ok(ctx) => {
                info!(algorithm = ctx.algorithm(), "encryption context initialized");
                Ok(Some(ctx))
            }
            Err(e) if self.recorder.fallback() == PlaintextFallback::Allow => {
                warn!(error = %e, "encryption unavailable, passwords will be stored in plaintext");
                Ok(None)
            }
            Err(e) => Err(PipelineError::KeyMaterial(e)),
        }
    }
}
