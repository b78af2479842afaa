//! Cross-account client factory
//!
//! Every component that talks to the recovery or inventory API gets its
//! client here. Without an account context the client runs as the
//! orchestrator itself; with one, the factory assumes the named role in the
//! target account using the shared external id.

use super::recovery_api::{InventoryApi, RecoveryApi, RemoteApiError};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::AccountContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Region plus optional account a set of resources lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceScope {
    /// Region
    pub region: String,
    /// Target account; `None` for the orchestrator's own
    pub account: Option<AccountContext>,
}

impl ResourceScope {
    /// Scope in `region`, optionally in another account
    pub fn new(region: impl Into<String>, account: Option<AccountContext>) -> Self {
        Self {
            region: region.into(),
            account,
        }
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.account {
            Some(account) => write!(f, "{}@{}", account.account_id(), self.region),
            None => write!(f, "self@{}", self.region),
        }
    }
}

/// Temporary credentials from a role assumption
#[derive(Clone, PartialEq, Eq)]
pub struct ScopedCredentials {
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ScopedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Identity a client is built for
#[derive(Debug, Clone)]
pub struct ClientScope {
    /// Region
    pub region: String,
    /// Assumed-role credentials; `None` means the orchestrator's own identity
    pub credentials: Option<ScopedCredentials>,
}

/// Role assumption primitive
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    /// Assume `role_arn` presenting `external_id`
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        external_id: &str,
    ) -> Result<ScopedCredentials, RemoteApiError>;
}

/// Builds concrete API clients for a scope
pub trait ClientConnector: Send + Sync {
    /// Recovery API client
    fn recovery_client(&self, scope: &ClientScope) -> Arc<dyn RecoveryApi>;

    /// Inventory API client
    fn inventory_client(&self, scope: &ClientScope) -> Arc<dyn InventoryApi>;
}

/// Services the factory can hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Remote recovery API
    Recovery,
    /// Compute inventory API
    Inventory,
}

/// A client for one [`ServiceKind`]
#[derive(Clone)]
pub enum ServiceClient {
    /// Recovery API client
    Recovery(Arc<dyn RecoveryApi>),
    /// Inventory API client
    Inventory(Arc<dyn InventoryApi>),
}

/// Cross-account client factory
pub struct ClientFactory {
    connector: Arc<dyn ClientConnector>,
    assumer: Arc<dyn RoleAssumer>,
    session_name: String,
    refresh_margin: chrono::Duration,
    credential_cache: DashMap<(String, String), ScopedCredentials>,
}

impl ClientFactory {
    /// Create new client factory
    pub fn new(
        connector: Arc<dyn ClientConnector>,
        assumer: Arc<dyn RoleAssumer>,
        session_name: impl Into<String>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            connector,
            assumer,
            session_name: session_name.into(),
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            credential_cache: DashMap::new(),
        }
    }

    /// Client for `service` in `region`, impersonating `account` when given
    pub async fn get_client(
        &self,
        service: ServiceKind,
        region: &str,
        account: Option<&AccountContext>,
    ) -> OrchestratorResult<ServiceClient> {
        let scope = self.client_scope(region, account).await?;
        Ok(match service {
            ServiceKind::Recovery => ServiceClient::Recovery(self.connector.recovery_client(&scope)),
            ServiceKind::Inventory => {
                ServiceClient::Inventory(self.connector.inventory_client(&scope))
            }
        })
    }

    /// Recovery API client for `scope`
    pub async fn recovery_client(
        &self,
        scope: &ResourceScope,
    ) -> OrchestratorResult<Arc<dyn RecoveryApi>> {
        let client_scope = self
            .client_scope(&scope.region, scope.account.as_ref())
            .await?;
        Ok(self.connector.recovery_client(&client_scope))
    }

    /// Inventory API client for `scope`
    pub async fn inventory_client(
        &self,
        scope: &ResourceScope,
    ) -> OrchestratorResult<Arc<dyn InventoryApi>> {
        let client_scope = self
            .client_scope(&scope.region, scope.account.as_ref())
            .await?;
        Ok(self.connector.inventory_client(&client_scope))
    }

    /// Drop cached credentials for an account, forcing the next call to re-assume
    pub fn invalidate(&self, account: &AccountContext) {
        self.credential_cache.remove(&cache_key(account));
    }

    async fn client_scope(
        &self,
        region: &str,
        account: Option<&AccountContext>,
    ) -> OrchestratorResult<ClientScope> {
        let credentials = match account {
            None => None,
            Some(account) => Some(self.credentials_for(account).await?),
        };
        Ok(ClientScope {
            region: region.to_string(),
            credentials,
        })
    }

    async fn credentials_for(&self, account: &AccountContext) -> OrchestratorResult<ScopedCredentials> {
        let key = cache_key(account);
        if let Some(cached) = self.credential_cache.get(&key) {
            if cached.expires_at - self.refresh_margin > Utc::now() {
                debug!(account_id = account.account_id(), "using cached assumed-role credentials");
                return Ok(cached.clone());
            }
        }

        if account.account_id().trim().is_empty() || account.role_name().trim().is_empty() {
            return Err(OrchestratorError::CrossAccountAuth {
                account_id: account.account_id().to_string(),
                role_name: account.role_name().to_string(),
                reason: "account id and role name are required".to_string(),
            });
        }

        // Assumption failures are configuration problems; no retry here.
        let credentials = self
            .assumer
            .assume_role(&account.role_arn(), &self.session_name, account.external_id())
            .await
            .map_err(|e| {
                warn!(
                    account_id = account.account_id(),
                    role = account.role_name(),
                    error = %e,
                    "role assumption failed"
                );
                OrchestratorError::CrossAccountAuth {
                    account_id: account.account_id().to_string(),
                    role_name: account.role_name().to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!(
            account_id = account.account_id(),
            role = account.role_name(),
            expires_at = %credentials.expires_at,
            "assumed cross-account role"
        );
        self.credential_cache.insert(key, credentials.clone());
        Ok(credentials)
    }
}

fn cache_key(account: &AccountContext) -> (String, String) {
    (
        account.account_id().to_string(),
        account.role_name().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CROSS_ACCOUNT_EXTERNAL_ID;
    use crate::testing::{MockInventoryApi, MockRecoveryApi, StaticConnector, StaticRoleAssumer};

    fn factory(assumer: Arc<StaticRoleAssumer>) -> (ClientFactory, Arc<StaticConnector>) {
        let connector = Arc::new(StaticConnector::new(
            Arc::new(MockRecoveryApi::new()),
            Arc::new(MockInventoryApi::new()),
        ));
        let factory = ClientFactory::new(
            connector.clone(),
            assumer,
            "test-session",
            Duration::from_secs(60),
        );
        (factory, connector)
    }

    #[tokio::test]
    async fn test_own_identity_skips_assumption() {
        let assumer = Arc::new(StaticRoleAssumer::new());
        let (factory, connector) = factory(assumer.clone());

        let client = factory
            .get_client(ServiceKind::Recovery, "us-east-1", None)
            .await
            .unwrap();
        assert!(matches!(client, ServiceClient::Recovery(_)));
        assert_eq!(assumer.calls().len(), 0);

        let scopes = connector.scopes();
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].credentials.is_none());
        assert_eq!(scopes[0].region, "us-east-1");
    }

    #[tokio::test]
    async fn test_assumes_role_with_fixed_external_id() {
        let assumer = Arc::new(StaticRoleAssumer::new());
        let (factory, connector) = factory(assumer.clone());
        let account = AccountContext::new("123456789012", "DrRole");

        factory
            .inventory_client(&ResourceScope::new("eu-west-1", Some(account)))
            .await
            .unwrap();

        let calls = assumer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].role_arn, "arn:aws:iam::123456789012:role/DrRole");
        assert_eq!(calls[0].external_id, CROSS_ACCOUNT_EXTERNAL_ID);
        assert_eq!(calls[0].session_name, "test-session");
        assert!(connector.scopes()[0].credentials.is_some());
    }

    #[tokio::test]
    async fn test_credentials_are_cached_until_refresh_margin() {
        let assumer = Arc::new(StaticRoleAssumer::new());
        let (factory, _) = factory(assumer.clone());
        let scope = ResourceScope::new("us-east-1", Some(AccountContext::new("1", "r")));

        factory.recovery_client(&scope).await.unwrap();
        factory.recovery_client(&scope).await.unwrap();
        assert_eq!(assumer.calls().len(), 1);

        factory.invalidate(scope.account.as_ref().unwrap());
        factory.recovery_client(&scope).await.unwrap();
        assert_eq!(assumer.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_near_expiry_credentials_are_refreshed() {
        let assumer = Arc::new(StaticRoleAssumer::with_lifetime(chrono::Duration::seconds(30)));
        let (factory, _) = factory(assumer.clone());
        let scope = ResourceScope::new("us-east-1", Some(AccountContext::new("1", "r")));

        // lifetime is shorter than the 60s refresh margin
        factory.recovery_client(&scope).await.unwrap();
        factory.recovery_client(&scope).await.unwrap();
        assert_eq!(assumer.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_assumption_failure_is_cross_account_auth_and_not_retried() {
        let assumer = Arc::new(StaticRoleAssumer::new());
        assumer.fail_with(RemoteApiError::AccessDenied {
            message: "not authorized to perform sts:AssumeRole".to_string(),
        });
        let (factory, _) = factory(assumer.clone());
        let scope = ResourceScope::new("us-east-1", Some(AccountContext::new("9", "Missing")));

        let err = factory.recovery_client(&scope).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::CrossAccountAuth { .. }));
        assert!(err.to_string().contains("sts:AssumeRole"));
        assert_eq!(assumer.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_role_name_rejected() {
        let assumer = Arc::new(StaticRoleAssumer::new());
        let (factory, _) = factory(assumer.clone());
        let scope = ResourceScope::new("us-east-1", Some(AccountContext::new("1", " ")));
        let err = factory.recovery_client(&scope).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::CrossAccountAuth { .. }));
        assert!(assumer.calls().is_empty());
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = ScopedCredentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "super-secret".to_string(),
            session_token: "token".to_string(),
            expires_at: Utc::now(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_scope_display() {
        let own = ResourceScope::new("us-east-1", None);
        assert_eq!(own.to_string(), "self@us-east-1");
        let other = ResourceScope::new("us-west-2", Some(AccountContext::new("42", "r")));
        assert_eq!(other.to_string(), "42@us-west-2");
    }
}
