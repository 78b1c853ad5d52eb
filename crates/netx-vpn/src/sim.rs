//! In-process platform and backend
//!
//! [`SimulatedPlatform`] behaves like an OS VPN manager hosting the tunnel
//! process: starts and stops complete asynchronously through status
//! notifications, and the tunnel answers the message protocol.
//! [`SimulatedBackend`] hands out gateways and leases with an account
//! device limit. Both can be told to misbehave.

use crate::backend::{LeaseBackend, LeaseRequest};
use crate::config::{Gateway, Lease, TunnelConfig};
use crate::error::{BackendError, PlatformError, TransportError};
use crate::keys::{KeyPair, PublicKey};
use crate::platform::{PlatformStatus, PlatformVpnBoundary, StatusNotification};
use crate::protocol::{REPORT_OFF, TunnelCommand};
use async_trait::async_trait;
use netx_runtime::{EventBus, Subscription, TaskGroup};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

struct PlatformState {
    permission: bool,
    enabled: bool,
    on_demand: bool,
    has_profile: bool,
    config: Option<TunnelConfig>,
    status: PlatformStatus,
    generation: u64,
    running: bool,
    pause_until: Option<Instant>,
    acknowledge_start: bool,
    acknowledge_stop: bool,
    reject_save: bool,
    transition_delay: Duration,
    starts: usize,
    stops: usize,
    messages: Vec<String>,
    fail_messages: usize,
    reply_override: Option<String>,
    message_delay: Duration,
    save_delay: Duration,
}

impl Default for PlatformState {
    fn default() -> Self {
        Self {
            permission: true,
            enabled: false,
            on_demand: false,
            has_profile: false,
            config: None,
            status: PlatformStatus::Disconnected,
            generation: 0,
            running: false,
            pause_until: None,
            acknowledge_start: true,
            acknowledge_stop: true,
            reject_save: false,
            transition_delay: Duration::from_millis(500),
            starts: 0,
            stops: 0,
            messages: Vec::new(),
            fail_messages: 0,
            reply_override: None,
            message_delay: Duration::ZERO,
            save_delay: Duration::ZERO,
        }
    }
}

/// OS VPN manager stand-in
pub struct SimulatedPlatform {
    state: Arc<Mutex<PlatformState>>,
    notifications: EventBus<StatusNotification>,
    tasks: TaskGroup,
}

impl SimulatedPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(PlatformState::default())),
            notifications: EventBus::stream(),
            tasks: TaskGroup::new("platform"),
        })
    }

    pub fn set_permission(&self, granted: bool) {
        self.lock().permission = granted;
    }

    /// Whether starts ever reach `connected`
    pub fn set_acknowledge_start(&self, acknowledge: bool) {
        self.lock().acknowledge_start = acknowledge;
    }

    /// Whether stops ever reach `disconnected`
    pub fn set_acknowledge_stop(&self, acknowledge: bool) {
        self.lock().acknowledge_stop = acknowledge;
    }

    pub fn set_transition_delay(&self, delay: Duration) {
        self.lock().transition_delay = delay;
    }

    /// Profile saves take this long to complete
    pub fn set_save_delay(&self, delay: Duration) {
        self.lock().save_delay = delay;
    }

    pub fn reject_saves(&self, reject: bool) {
        self.lock().reject_save = reject;
    }

    /// The next `count` messages get an error reply
    pub fn fail_next_messages(&self, count: usize) {
        self.lock().fail_messages = count;
    }

    /// The next message gets `reply` verbatim
    pub fn reply_with(&self, reply: &str) {
        self.lock().reply_override = Some(reply.to_string());
    }

    /// The tunnel process takes this long to answer
    pub fn set_message_delay(&self, delay: Duration) {
        self.lock().message_delay = delay;
    }

    /// Emit a notification as if the OS sent it
    pub fn emit(&self, status: PlatformStatus, generation: u64) {
        self.notifications.publish(StatusNotification::new(status, generation));
    }

    /// The tunnel dies on its own (OS kill, crash)
    pub fn drop_tunnel(&self) {
        let generation = {
            let mut state = self.lock();
            state.running = false;
            state.pause_until = None;
            state.status = PlatformStatus::Disconnected;
            state.generation
        };
        info!("Simulated tunnel dropped");
        self.emit(PlatformStatus::Disconnected, generation);
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }

    pub fn status(&self) -> PlatformStatus {
        self.lock().status
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn on_demand(&self) -> bool {
        self.lock().on_demand
    }

    pub fn has_profile(&self) -> bool {
        self.lock().has_profile
    }

    /// Configuration saved with the profile
    pub fn saved_config(&self) -> Option<TunnelConfig> {
        self.lock().config.clone()
    }

    /// Every message received, in wire form
    pub fn sent_messages(&self) -> Vec<String> {
        self.lock().messages.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finish a transition later, unless a newer call superseded it
    fn complete_later(&self, label: &str, generation: u64, target: PlatformStatus) {
        let state = self.state.clone();
        let notifications = self.notifications.clone();
        let delay = self.lock().transition_delay;

        self.tasks.spawn(label.to_string(), async move {
            sleep(delay).await;
            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation != generation {
                    return;
                }
                state.status = target;
                state.running = target.is_active();
                if !state.running {
                    state.pause_until = None;
                }
            }
            notifications.publish(StatusNotification::new(target, generation));
        });
    }

    fn answer(&self, message: &str) -> Result<String, TransportError> {
        let mut state = self.lock();
        let now = Instant::now();

        match TunnelCommand::decode(message) {
            Some(TunnelCommand::Report) => {
                if !state.running {
                    return Ok(REPORT_OFF.to_string());
                }
                let left = state
                    .pause_until
                    .map(|until| until.saturating_duration_since(now).as_secs())
                    .unwrap_or(0);
                Ok(left.to_string())
            }
            Some(TunnelCommand::Pause(seconds)) => {
                if !state.running {
                    return Err(TransportError::NoReply);
                }
                state.pause_until = (seconds > 0).then(|| now + Duration::from_secs(seconds));
                Ok(String::new())
            }
            Some(TunnelCommand::Request { .. }) => {
                if !state.running {
                    return Err(TransportError::NoReply);
                }
                Ok("{}".to_string())
            }
            Some(TunnelCommand::Connect { .. }) | Some(TunnelCommand::Disconnect) | None => {
                Ok(String::new())
            }
        }
    }
}

#[async_trait]
impl PlatformVpnBoundary for SimulatedPlatform {
    async fn has_permission(&self) -> bool {
        self.lock().permission
    }

    async fn enable(&self) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if !state.permission {
            return Err(PlatformError::NoPermission);
        }
        state.enabled = true;
        Ok(())
    }

    async fn disable(&self) -> Result<(), PlatformError> {
        self.lock().enabled = false;
        Ok(())
    }

    async fn set_on_demand(&self, enabled: bool) -> Result<(), PlatformError> {
        self.lock().on_demand = enabled;
        Ok(())
    }

    async fn save_configuration(
        &self,
        config: Option<TunnelConfig>,
        generation: u64,
    ) -> Result<(), PlatformError> {
        let delay = self.lock().save_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.permission {
            return Err(PlatformError::NoPermission);
        }
        if state.reject_save {
            return Err(PlatformError::Rejected("profile save refused".into()));
        }
        debug!("Saving profile (gateway: {})", config.is_some());
        state.config = config;
        state.has_profile = true;
        state.generation = state.generation.max(generation);
        Ok(())
    }

    async fn remove_configuration(&self) -> Result<(), PlatformError> {
        let generation = {
            let mut state = self.lock();
            state.config = None;
            state.has_profile = false;
            state.enabled = false;
            state.on_demand = false;
            state.running = false;
            state.pause_until = None;
            state.status = PlatformStatus::Invalid;
            state.generation
        };
        self.emit(PlatformStatus::Invalid, generation);
        Ok(())
    }

    async fn start(&self, generation: u64) -> Result<(), PlatformError> {
        let acknowledge = {
            let mut state = self.lock();
            if !state.permission {
                return Err(PlatformError::NoPermission);
            }
            if !state.has_profile {
                return Err(PlatformError::Rejected("no VPN profile".into()));
            }
            state.starts += 1;
            state.generation = generation;
            state.status = PlatformStatus::Connecting;
            state.acknowledge_start
        };

        self.emit(PlatformStatus::Connecting, generation);
        if acknowledge {
            self.complete_later("start", generation, PlatformStatus::Connected);
        }
        Ok(())
    }

    async fn stop(&self, generation: u64) {
        let acknowledge = {
            let mut state = self.lock();
            state.stops += 1;
            state.generation = generation;
            state.status = PlatformStatus::Disconnecting;
            state.acknowledge_stop
        };

        self.emit(PlatformStatus::Disconnecting, generation);
        if acknowledge {
            self.complete_later("stop", generation, PlatformStatus::Disconnected);
        }
    }

    fn current_status(&self) -> StatusNotification {
        let state = self.lock();
        StatusNotification::new(state.status, state.generation)
    }

    fn status_notifications(&self) -> Subscription<StatusNotification> {
        self.notifications.subscribe()
    }

    async fn send_message(&self, message: String, _timeout: Duration) -> Result<String, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.messages.push(message.clone());
            state.message_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        {
            let mut state = self.lock();
            if state.fail_messages > 0 {
                state.fail_messages -= 1;
                return Ok("error: simulated failure".to_string());
            }
            if let Some(reply) = state.reply_override.take() {
                return Ok(reply);
            }
        }
        self.answer(&message)
    }
}

struct BackendState {
    gateways: Vec<Gateway>,
    leases: Vec<Lease>,
    max_devices: usize,
    lease_duration: Duration,
    failure: Option<BackendError>,
    delay: Duration,
    calls: HashMap<&'static str, usize>,
}

/// Lease/gateway API stand-in
pub struct SimulatedBackend {
    state: Mutex<BackendState>,
}

impl SimulatedBackend {
    pub fn new(gateways: Vec<Gateway>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                gateways,
                leases: Vec::new(),
                max_devices: 5,
                lease_duration: Duration::from_secs(24 * 3600),
                failure: None,
                delay: Duration::ZERO,
                calls: HashMap::new(),
            }),
        })
    }

    /// Backend with a handful of gateways on fresh keys
    pub fn with_default_gateways() -> Arc<Self> {
        let locations = [
            ("frankfurt", "europe-west", "DE", 1),
            ("stockholm", "europe-north", "SE", 2),
            ("new-york", "us-east", "US", 3),
            ("tokyo", "asia-east", "JP", 4),
        ];
        let gateways = locations
            .into_iter()
            .map(|(location, region, country, n)| Gateway {
                public_key: KeyPair::generate().public,
                region: region.to_string(),
                location: location.to_string(),
                resource_usage_percent: 20 * n,
                ipv4: Ipv4Addr::new(185, 186, 78, n),
                ipv6: Ipv6Addr::new(0x2a07, 0xa880, 0x4601, n as u16, 0, 0, 0, 1),
                port: 51820,
                tags: vec![],
                country: Some(country.to_string()),
            })
            .collect();
        Self::new(gateways)
    }

    pub fn set_max_devices(&self, max: usize) {
        self.lock().max_devices = max;
    }

    pub fn set_lease_duration(&self, duration: Duration) {
        self.lock().lease_duration = duration;
    }

    /// Every call fails with `failure` until cleared with `None`
    pub fn fail_with(&self, failure: Option<BackendError>) {
        self.lock().failure = failure;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Server-side revocation of every lease
    pub fn drop_all_leases(&self) {
        self.lock().leases.clear();
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.lock().leases.clone()
    }

    pub fn gateways(&self) -> Vec<Gateway> {
        self.lock().gateways.clone()
    }

    /// How many times `operation` was called
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, wait the configured delay, apply the failure switch
    async fn enter(&self, operation: &'static str) -> Result<(), BackendError> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_default() += 1;
            state.delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        match self.lock().failure.clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LeaseBackend for SimulatedBackend {
    async fn list_gateways(&self) -> Result<Vec<Gateway>, BackendError> {
        self.enter("list_gateways").await?;
        Ok(self.gateways())
    }

    async fn create_lease(&self, request: LeaseRequest) -> Result<Lease, BackendError> {
        self.enter("create_lease").await?;
        let mut state = self.lock();

        if !state.gateways.iter().any(|g| g.public_key == request.gateway_id) {
            return Err(BackendError::Http(400));
        }

        let existing = state
            .leases
            .iter()
            .position(|l| l.account_id == request.account_id && l.public_key == request.public_key);
        let in_use = state
            .leases
            .iter()
            .filter(|l| l.account_id == request.account_id)
            .count();
        if existing.is_none() && in_use >= state.max_devices {
            return Err(BackendError::TooManyDevices);
        }

        let index = existing.unwrap_or(state.leases.len()) as u8;
        let lease = Lease {
            account_id: request.account_id,
            public_key: request.public_key,
            gateway_id: request.gateway_id,
            expires_at: SystemTime::now() + state.lease_duration,
            alias: request.alias,
            vip4: Ipv4Addr::new(10, 143, 0, index.wrapping_add(2)),
            vip6: Ipv6Addr::new(0xfdad, 0xb10c, 0xa, 0, 0, 0, 0, index as u16 + 2),
        };

        match existing {
            Some(i) => state.leases[i] = lease.clone(),
            None => state.leases.push(lease.clone()),
        }
        Ok(lease)
    }

    async fn get_lease(
        &self,
        account_id: &str,
        public_key: &PublicKey,
    ) -> Result<Option<Lease>, BackendError> {
        self.enter("get_lease").await?;
        let now = SystemTime::now();
        Ok(self
            .lock()
            .leases
            .iter()
            .find(|l| l.account_id == account_id && &l.public_key == public_key && l.expires_at > now)
            .cloned())
    }

    async fn get_leases(&self, account_id: &str) -> Result<Vec<Lease>, BackendError> {
        self.enter("get_leases").await?;
        Ok(self
            .lock()
            .leases
            .iter()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn delete_lease(&self, request: LeaseRequest) -> Result<(), BackendError> {
        self.enter("delete_lease").await?;
        let mut state = self.lock();
        let before = state.leases.len();
        state
            .leases
            .retain(|l| !(l.account_id == request.account_id && l.public_key == request.public_key));

        if state.leases.len() == before {
            return Err(BackendError::LeaseNotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(backend: &SimulatedBackend, account: &str) -> LeaseRequest {
        LeaseRequest {
            account_id: account.to_string(),
            public_key: KeyPair::generate().public,
            gateway_id: backend.gateways()[0].public_key,
            alias: None,
        }
    }

    #[tokio::test]
    async fn test_backend_device_limit() {
        let backend = SimulatedBackend::with_default_gateways();
        backend.set_max_devices(1);

        let first = request(&backend, "acc");
        backend.create_lease(first.clone()).await.unwrap();
        // Same device renews instead of taking a second slot
        backend.create_lease(first).await.unwrap();

        let second = request(&backend, "acc");
        assert_eq!(backend.create_lease(second).await, Err(BackendError::TooManyDevices));
        assert_eq!(backend.get_leases("acc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_delete_unknown_lease() {
        let backend = SimulatedBackend::with_default_gateways();
        let req = request(&backend, "acc");
        assert_eq!(backend.delete_lease(req).await, Err(BackendError::LeaseNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_start_acknowledged() {
        let platform = SimulatedPlatform::new();
        let mut notifications = platform.status_notifications();

        platform.save_configuration(None, 1).await.unwrap();
        platform.start(1).await.unwrap();

        let connected = notifications.wait_for(|n| n.status.is_active()).await.unwrap();
        assert_eq!(connected, StatusNotification::new(PlatformStatus::Connected, 1));
        assert_eq!(platform.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_start_never_connects() {
        let platform = SimulatedPlatform::new();
        let mut notifications = platform.status_notifications();

        platform.save_configuration(None, 1).await.unwrap();
        platform.start(1).await.unwrap();
        platform.stop(2).await;

        let down = notifications.wait_for(|n| n.status.is_down()).await.unwrap();
        assert_eq!(down.generation, 2);
        assert!(notifications.drain().iter().all(|n| !n.status.is_active()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_profile_is_rejected() {
        let platform = SimulatedPlatform::new();
        assert!(matches!(platform.start(1).await, Err(PlatformError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_report() {
        let platform = SimulatedPlatform::new();
        let mut notifications = platform.status_notifications();
        platform.save_configuration(None, 1).await.unwrap();
        platform.start(1).await.unwrap();
        notifications.wait_for(|n| n.status.is_active()).await;

        let timeout = Duration::from_secs(5);
        platform.send_message("pause 300".into(), timeout).await.unwrap();
        sleep(Duration::from_secs(100)).await;
        assert_eq!(platform.send_message("report".into(), timeout).await, Ok("200".into()));

        platform.send_message("pause 0".into(), timeout).await.unwrap();
        assert_eq!(platform.send_message("report".into(), timeout).await, Ok("0".into()));
        assert_eq!(platform.send_message("bogus".into(), timeout).await, Ok(String::new()));
    }
}
