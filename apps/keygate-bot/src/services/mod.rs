use thiserror::Error;

use crate::clients::VpnError;

pub mod reconciliation_service;
pub mod sweeper_service;

#[cfg(test)]
pub mod test_support;

/// Failure taxonomy of the reconciliation engine. Everything the webhook
/// collaborator should retry (via the provider's at-least-once
/// redelivery) comes back as an error; drops and replays are `Ok`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("trial already used")]
    TrialAlreadyUsed,
    #[error("entitlement {entitlement_id} does not belong to user {user_id}")]
    OwnershipMismatch { entitlement_id: i64, user_id: i64 },
    #[error("vpn backend failure: {0}")]
    Vpn(#[from] VpnError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
