//! netx VPN - Tunnel Session Client Core
//!
//! Drives an OS-managed VPN resource through an asynchronous, failure-prone
//! platform API while negotiating keys, gateways and leases with a backend.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────┐
//!  │                 TunnelSessionController                  │
//!  │  turnOn / turnOff / changeGateway / clearLease queues    │
//!  │                                                          │
//!  │  ┌─────────────────────┐        ┌─────────────────────┐  │
//!  │  │ LeaseGatewayManager │        │     TunnelLink      │  │
//!  │  │ keypair, lease      │        │ connect/report/pause│  │
//!  │  └──────────┬──────────┘        └──────────┬──────────┘  │
//!  └─────────────│──────────────────────────────│─────────────┘
//!                ▼                              ▼
//!        ┌───────────────┐            ┌──────────────────────┐
//!        │ LeaseBackend  │            │ PlatformVpnBoundary  │
//!        │ (REST API)    │            │ (OS VPN manager)     │
//!        └───────────────┘            └──────────────────────┘
//! ```
//!
//! # Features
//!
//! - **State machine**: Off, Activating, Active, Deactivating, Error, NoPermission
//! - **Stale rejection**: platform notifications carry the attempt id that caused them
//! - **Bounded waits**: start retried once, unconfirmed stop forced to Off
//! - **Lease lifecycle**: creation, verification, renewal before expiry, revocation
//! - **Pause**: filtering paused through the tunnel message protocol
//!
//! # Security
//!
//! - Private keys never appear in logs (`Debug` and message log forms redact them)
//! - A regenerated keypair invalidates the lease bound to the old one

mod backend;
mod config;
mod controller;
mod error;
mod keys;
mod lease;
mod link;
mod platform;
mod protocol;
mod settings;
pub mod sim;
mod store;

pub use backend::{LeaseBackend, LeaseRequest};
pub use config::{DNS_PREFIX, Endpoint, Gateway, Lease, TunnelConfig, dns_hint};
pub use controller::{
    ControllerConfig, ErrorReason, SessionState, TUNNEL_COMPONENT, TunnelSession,
    TunnelSessionController, TunnelStatus,
};
pub use error::{BackendError, PlatformError, TransportError, TunnelError};
pub use keys::{DeviceKeypair, KeyError, KeyGenerator, KeyPair, PrivateKey, PublicKey, X25519Generator};
pub use lease::{API_COMPONENT, LeaseGatewayManager, LeaseManagerConfig, LeaseRevoker, LeaseSnapshot};
pub use link::TunnelLink;
pub use platform::{PlatformStatus, PlatformVpnBoundary, StatusNotification};
pub use protocol::{REPORT_OFF, TunnelCommand, parse_pause_seconds, parse_reply};
pub use settings::{NetxSettings, SettingsError, TimingSettings, TrackerSettings};
pub use store::{JsonFileStore, MemoryStore, PersistedSession, SessionStore, StoreError};
