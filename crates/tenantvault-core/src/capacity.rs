//! Capacity gate.
//!
//! Turns "how many database users exist in the source project" into a
//! provisioning mode: above the threshold a new isolated project is created,
//! otherwise the existing shared project is reused.

use std::sync::Arc;

use tracing::info;

use crate::error::CapacityError;

/// Default threshold above which a new project is provisioned.
pub const DEFAULT_USER_THRESHOLD: u64 = 80;

/// The outcome of the capacity gate for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningDecision {
    /// Whether a new project and cluster must be provisioned.
    pub create_new: bool,
    /// The user count the decision was made from.
    pub user_count: u64,
}

/// Decide the provisioning mode from a user count. A count equal to the
/// threshold still reuses the existing project.
#[must_use]
pub fn decide(user_count: u64, threshold: u64) -> ProvisioningDecision {
    ProvisioningDecision {
        create_new: user_count > threshold,
        user_count,
    }
}

/// Source of the current tenant population.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// Count the database users in `project_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the count cannot be obtained. A failure is
    /// never reported as a count of zero.
    async fn count_users(&self, project_id: &str) -> Result<u64, CapacityError>;
}

/// Queries a [`UserDirectory`] and applies the threshold.
pub struct CapacityGate {
    directory: Arc<dyn UserDirectory>,
    threshold: u64,
}

impl CapacityGate {
    /// Create a gate over `directory` with the given threshold.
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>, threshold: u64) -> Self {
        Self {
            directory,
            threshold,
        }
    }

    /// Count users in `project_id` and decide the provisioning mode.
    ///
    /// # Errors
    ///
    /// Propagates the directory's [`CapacityError`] unchanged. There is no retry.
    pub async fn evaluate(&self, project_id: &str) -> Result<ProvisioningDecision, CapacityError> {
        let count = self.directory.count_users(project_id).await?;
        let decision = decide(count, self.threshold);
        info!(
            project_id,
            user_count = count,
            threshold = self.threshold,
            create_new = decision.create_new,
            "capacity decision made"
        );
        Ok(decision)
    }
}

impl std::fmt::Debug for CapacityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityGate")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
