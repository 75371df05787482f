use std::sync::Arc;

use serde::Serialize;

use super::policy::{PolicyCache, PolicyConfig};

/// Standing reason an actor can never be punished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemptReason {
    Owner,
    ServiceAccount,
    TrustedAdmin,
    Whitelisted,
}

pub struct ExemptionEvaluator {
    policies: Arc<PolicyCache>,
    service_id: u64,
}

impl ExemptionEvaluator {
    pub fn new(policies: Arc<PolicyCache>, service_id: u64) -> Self {
        Self {
            policies,
            service_id,
        }
    }

    /// Pure check against an already loaded policy.
    /// The actor must already be resolved through any on-behalf-of relay.
    pub fn exemption(&self, policy: &PolicyConfig, actor_id: u64) -> Option<ExemptReason> {
        if policy.owner_id == Some(actor_id) {
            Some(ExemptReason::Owner)
        } else if actor_id == self.service_id {
            Some(ExemptReason::ServiceAccount)
        } else if policy.trusted_admins.contains(&actor_id) {
            Some(ExemptReason::TrustedAdmin)
        } else if policy.whitelist.contains(&actor_id) {
            Some(ExemptReason::Whitelisted)
        } else {
            None
        }
    }

    /// Cached lookup. If the policy cannot be read the actor counts as exempt.
    pub async fn is_exempt(&self, guild_id: u64, actor_id: u64) -> bool {
        match self.policies.get(guild_id).await {
            Ok(policy) => self.exemption(&policy, actor_id).is_some(),
            Err(e) => {
                tracing::warn!(%guild_id, actor_id, error = %e, "policy unavailable, treating actor as exempt");
                true
            }
        }
    }
}
