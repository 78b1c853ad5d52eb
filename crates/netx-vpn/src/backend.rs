//! Lease/gateway backend API.

use crate::config::{Gateway, Lease};
use crate::error::BackendError;
use crate::keys::PublicKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Body of lease creation and deletion calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub account_id: String,
    pub public_key: PublicKey,
    pub gateway_id: PublicKey,
    #[serde(default)]
    pub alias: Option<String>,
}

impl LeaseRequest {
    /// Request matching an existing lease (for deletion)
    pub fn for_lease(lease: &Lease) -> Self {
        Self {
            account_id: lease.account_id.clone(),
            public_key: lease.public_key,
            gateway_id: lease.gateway_id,
            alias: lease.alias.clone(),
        }
    }
}

/// Backend operations the lease manager depends on
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn list_gateways(&self) -> Result<Vec<Gateway>, BackendError>;

    /// Register the device key with a gateway. Fails with
    /// [`BackendError::TooManyDevices`] when the account is full.
    async fn create_lease(&self, request: LeaseRequest) -> Result<Lease, BackendError>;

    /// Lease of this device, if the backend still has one
    async fn get_lease(
        &self,
        account_id: &str,
        public_key: &PublicKey,
    ) -> Result<Option<Lease>, BackendError>;

    /// All leases of the account
    async fn get_leases(&self, account_id: &str) -> Result<Vec<Lease>, BackendError>;

    async fn delete_lease(&self, request: LeaseRequest) -> Result<(), BackendError>;
}
