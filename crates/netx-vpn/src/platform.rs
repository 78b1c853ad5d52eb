//! OS VPN manager boundary.
//!
//! The tunnel controller is the only component that talks to the platform.
//! Every call that changes the tunnel lifecycle carries the controller's
//! attempt id as `generation`. The platform stamps the status notifications
//! it emits with the generation of the call that caused them, or with the
//! last generation it saw when nothing local caused them.

use crate::config::TunnelConfig;
use crate::error::{PlatformError, TransportError};
use async_trait::async_trait;
use netx_runtime::Subscription;
use std::time::Duration;

/// Status reported by the OS VPN manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformStatus {
    Connected,
    Connecting,
    Disconnected,
    Disconnecting,
    Invalid,
    Reasserting,
}

impl PlatformStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, PlatformStatus::Connected)
    }

    /// A transition the platform has not finished yet
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            PlatformStatus::Connecting | PlatformStatus::Disconnecting | PlatformStatus::Reasserting
        )
    }

    pub fn is_down(&self) -> bool {
        matches!(self, PlatformStatus::Disconnected | PlatformStatus::Invalid)
    }
}

/// A status change and the attempt that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusNotification {
    pub status: PlatformStatus,
    pub generation: u64,
}

impl StatusNotification {
    pub fn new(status: PlatformStatus, generation: u64) -> Self {
        Self { status, generation }
    }
}

/// The OS VPN manager / network extension host
#[async_trait]
pub trait PlatformVpnBoundary: Send + Sync {
    /// Has the user allowed this app to create a VPN profile?
    async fn has_permission(&self) -> bool;

    /// Mark the VPN profile enabled and persist it
    async fn enable(&self) -> Result<(), PlatformError>;

    /// Mark the VPN profile disabled and persist it
    async fn disable(&self) -> Result<(), PlatformError>;

    /// Toggle on-demand reconnection and persist it
    async fn set_on_demand(&self, enabled: bool) -> Result<(), PlatformError>;

    /// Persist the tunnel configuration; `None` runs without a gateway
    async fn save_configuration(
        &self,
        config: Option<TunnelConfig>,
        generation: u64,
    ) -> Result<(), PlatformError>;

    /// Remove the VPN profile entirely
    async fn remove_configuration(&self) -> Result<(), PlatformError>;

    /// Ask the OS to start the tunnel; completion arrives as a notification
    async fn start(&self, generation: u64) -> Result<(), PlatformError>;

    /// Ask the OS to stop the tunnel; completion arrives as a notification
    async fn stop(&self, generation: u64);

    /// Status as of now
    fn current_status(&self) -> StatusNotification;

    /// Every status change from now on
    fn status_notifications(&self) -> Subscription<StatusNotification>;

    /// Send a message to the running tunnel process
    async fn send_message(&self, message: String, timeout: Duration) -> Result<String, TransportError>;
}
