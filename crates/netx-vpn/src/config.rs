//! Tunnel Configuration
//!
//! Gateways and leases as the backend hands them out, and the
//! [`TunnelConfig`] assembled from them for the tunnel process.

use crate::error::TunnelError;
use crate::keys::{DeviceKeypair, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime};

/// Fixed /64 the per-device DNS address lives in
pub const DNS_PREFIX: &str = "2001:678:e34:1d::";

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// A selectable VPN exit node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    /// Gateway public key; also its id
    pub public_key: PublicKey,
    pub region: String,
    /// Dash separated location slug, e.g. `new-york`
    pub location: String,
    #[serde(default)]
    pub resource_usage_percent: u8,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl Gateway {
    pub fn id(&self) -> PublicKey {
        self.public_key
    }

    /// `new-york` -> `New York`
    pub fn nice_name(&self) -> String {
        self.location
            .split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(IpAddr::V4(self.ipv4), self.port)
    }
}

/// Time-bounded binding of a device key to a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub account_id: String,
    /// Device public key
    pub public_key: PublicKey,
    pub gateway_id: PublicKey,
    pub expires_at: SystemTime,
    #[serde(default)]
    pub alias: Option<String>,
    pub vip4: Ipv4Addr,
    pub vip6: Ipv6Addr,
}

impl Lease {
    pub fn is_active(&self) -> bool {
        self.expires_at > SystemTime::now()
    }

    /// Time until expiry, `None` once expired
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at.duration_since(SystemTime::now()).ok()
    }

    pub fn is_for(&self, gateway: &Gateway) -> bool {
        self.gateway_id == gateway.public_key
    }

    pub fn nice_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.public_key.to_base64().chars().take(5).collect())
    }
}

/// Everything the tunnel process needs to route through a gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub private_key: PrivateKey,
    pub gateway: Gateway,
    pub lease: Lease,
    pub user_agent: String,
    pub device_tag: String,
}

impl TunnelConfig {
    /// Assemble a config, refusing inconsistent parts.
    ///
    /// The lease must be unexpired, issued for `gateway` and bound to the
    /// keypair's public key.
    pub fn new(
        keypair: &DeviceKeypair,
        gateway: Gateway,
        lease: Lease,
        user_agent: impl Into<String>,
        device_tag: impl Into<String>,
    ) -> Result<Self, TunnelError> {
        if !lease.is_for(&gateway) {
            return Err(TunnelError::config_missing("lease for selected gateway"));
        }
        if lease.public_key != keypair.public_key() {
            return Err(TunnelError::config_missing("lease for device keypair"));
        }
        if !lease.is_active() {
            return Err(TunnelError::config_missing("active lease"));
        }

        Ok(Self {
            private_key: keypair.private_key().clone(),
            gateway,
            lease,
            user_agent: user_agent.into(),
            device_tag: device_tag.into(),
        })
    }

    /// DNS server address the backend expects for this device
    pub fn dns(&self) -> String {
        dns_hint(&self.device_tag)
    }
}

/// Per-device DNS address derived from the device tag.
///
/// Six-character tags use `<first 2>:<last 4>`, longer tags use
/// `<first 3>:<next 4>:<last 4>`, both appended to [`DNS_PREFIX`].
pub fn dns_hint(tag: &str) -> String {
    let chars: Vec<char> = tag.chars().collect();
    let slice = |from: usize, to: usize| -> String {
        chars[from.min(chars.len())..to.min(chars.len())].iter().collect()
    };
    let suffix = slice(chars.len().saturating_sub(4), chars.len());

    if chars.len() == 6 {
        format!("{}{}:{}", DNS_PREFIX, slice(0, 2), suffix)
    } else {
        format!("{}{}:{}:{}", DNS_PREFIX, slice(0, 3), slice(3, 7), suffix)
    }
}
