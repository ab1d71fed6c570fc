//! Credential refresh for storage requests.
//!
//! A request rejected with `403` is retried once after asking the
//! [`AuthProvider`] for a fresh credential. The provider is passed in
//! explicitly to the engine, the daemon or the client that needs it.

use async_trait::async_trait;

/// Identifies the container a credential is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTarget {
    /// Storage module spec as given at attach time.
    pub storage: String,
    pub account: String,
    pub container: String,
}

/// Source of fresh credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Return a new credential for `target`, or `None` if none is available.
    async fn refresh(&self, target: &AuthTarget) -> Option<String>;
}

/// Provider that always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    token: String,
}

impl StaticAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn refresh(&self, target: &AuthTarget) -> Option<String> {
        tracing::debug!(container = %target.container, "handing out static credential");
        Some(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_auth_returns_token() {
        let provider = StaticAuth::new("sekrit");
        let target = AuthTarget {
            storage: "memory".into(),
            account: "acct".into(),
            container: "cont".into(),
        };
        assert_eq!(provider.refresh(&target).await.as_deref(), Some("sekrit"));
    }
}
