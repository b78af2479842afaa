//! Cross-account context

use serde::{Deserialize, Serialize};

/// External id presented on every role assumption, shared by all target accounts.
pub const CROSS_ACCOUNT_EXTERNAL_ID: &str = "stratoswarm-failover-orchestration";

/// Target account and role the orchestrator assumes for remote calls
///
/// Immutable once built. The external id is always [`CROSS_ACCOUNT_EXTERNAL_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountContext {
    account_id: String,
    role_name: String,
    #[serde(default = "default_external_id", skip_deserializing)]
    external_id: String,
}

fn default_external_id() -> String {
    CROSS_ACCOUNT_EXTERNAL_ID.to_string()
}

impl AccountContext {
    /// Create a context for `role_name` in `account_id`
    pub fn new(account_id: impl Into<String>, role_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            role_name: role_name.into(),
            external_id: default_external_id(),
        }
    }

    /// Target account id
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Role assumed in the target account
    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// External id presented on assumption
    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// ARN of the role to assume
    pub fn role_arn(&self) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account_id, self.role_name)
    }
}
