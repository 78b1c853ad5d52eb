//! Tunnel session state machine
//!
//! [`TunnelSessionController`] owns the platform VPN resource. Every
//! transition runs inside a named [`TaskQueue`] execution; the state checks
//! in [`TunnelSessionController::begin`] keep transitions on different
//! queues from overlapping.
//!
//! # States
//!
//! ```text
//!            turn_on                 connected
//!   Off ───────────────▶ Activating ───────────▶ Active
//!    ▲                      │ retries exhausted    │ turn_off
//!    │                      ▼                      ▼
//!    │                Error(reason)           Deactivating
//!    └─────────────────────────────────────────────┘
//!               disconnected (or stop timeout)
//! ```
//!
//! Platform status notifications are projected onto the state directly,
//! outside the queues. Each carries the generation (attempt id) of the call
//! that caused it; anything older than the current attempt is dropped.

use crate::config::{Gateway, TunnelConfig};
use crate::error::TunnelError;
use crate::keys::{DeviceKeypair, PublicKey};
use crate::lease::{LeaseGatewayManager, LeaseRevoker};
use crate::link::TunnelLink;
use crate::platform::{PlatformStatus, PlatformVpnBoundary, StatusNotification};
use crate::settings::{NetxSettings, TimingSettings};
use crate::store::SessionStore;
use netx_runtime::{
    ActivityBus, ComponentEvent, ErrorClass, EventBus, QueueConfig, Severity, Subscription,
    TaskGroup, TaskQueue,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Component name of unsolicited tunnel events
pub const TUNNEL_COMPONENT: &str = "tunnel";

/// Why the session ended up in [`SessionState::Error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    /// The platform never reported the tunnel up
    RetryLimitReached,
    Failed(TunnelError),
}

/// Tunnel session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Off,
    Activating,
    Active,
    Deactivating,
    Error(ErrorReason),
    NoPermission,
}

impl SessionState {
    /// A transition is running
    pub fn is_transitional(&self) -> bool {
        matches!(self, SessionState::Activating | SessionState::Deactivating)
    }
}

/// Snapshot published on every session change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub state: SessionState,
    pub attempt_id: u64,
    pub retry_count: u32,
    /// Traffic goes through a gateway (otherwise filtering only)
    pub vpn_enabled: bool,
}

/// Result of a status query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatus {
    pub active: bool,
    pub in_progress: bool,
    pub gateway_id: Option<PublicKey>,
    pub pause_seconds: u64,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device_id: String,
    pub device_tag: String,
    pub user_agent: String,
    pub timing: TimingSettings,
}

impl ControllerConfig {
    pub fn from_settings(settings: &NetxSettings) -> Self {
        Self {
            device_id: settings.device_id.clone(),
            device_tag: settings.device_tag.clone(),
            user_agent: settings.user_agent.clone(),
            timing: settings.timing,
        }
    }

    fn query_budget(&self) -> Duration {
        self.timing.message_timeout() * 2 + self.timing.report_retry_delay()
    }
}

struct SessionCore {
    state: SessionState,
    attempt_id: u64,
    retry_count: u32,
    vpn_enabled: bool,
}

impl SessionCore {
    fn snapshot(&self) -> TunnelSession {
        TunnelSession {
            state: self.state.clone(),
            attempt_id: self.attempt_id,
            retry_count: self.retry_count,
            vpn_enabled: self.vpn_enabled,
        }
    }
}

/// Drives the platform VPN resource through its lifecycle
pub struct TunnelSessionController {
    config: ControllerConfig,
    platform: Arc<dyn PlatformVpnBoundary>,
    link: TunnelLink,
    leases: Arc<LeaseGatewayManager>,
    store: Arc<dyn SessionStore>,
    activity: ActivityBus,
    core: Mutex<SessionCore>,
    sessions: EventBus<TunnelSession>,
    statuses: EventBus<TunnelStatus>,
    errors: EventBus<TunnelError>,
    turn_on: TaskQueue<(), (), TunnelError>,
    turn_off: TaskQueue<(), (), TunnelError>,
    change_gateway: TaskQueue<Gateway, (), TunnelError>,
    clear_lease: TaskQueue<(), (), TunnelError>,
    query_status: TaskQueue<(), TunnelStatus, TunnelError>,
    change_pause: TaskQueue<Option<SystemTime>, TunnelStatus, TunnelError>,
    tasks: TaskGroup,
}

impl TunnelSessionController {
    /// Must be called inside a tokio runtime
    pub fn new(
        config: ControllerConfig,
        platform: Arc<dyn PlatformVpnBoundary>,
        leases: Arc<LeaseGatewayManager>,
        store: Arc<dyn SessionStore>,
        activity: ActivityBus,
    ) -> Arc<Self> {
        let vpn_enabled = store.load().map(|s| s.vpn_enabled).unwrap_or(false);
        let core = SessionCore {
            state: SessionState::Off,
            attempt_id: 0,
            retry_count: 0,
            vpn_enabled,
        };

        let t = config.timing;
        let user = |name: &str, budget: Duration| {
            QueueConfig::new(name).debounce(t.debounce()).timeout(budget).major()
        };
        let link = TunnelLink::new(platform.clone(), t.message_timeout(), t.report_retry_delay());

        let controller = Arc::new(Self {
            turn_on: TaskQueue::new(user("turnOn", t.turn_on_budget()), activity.clone()),
            turn_off: TaskQueue::new(user("turnOff", t.turn_off_budget()), activity.clone()),
            change_gateway: TaskQueue::new(
                user("changeGateway", t.turn_on_budget()),
                activity.clone(),
            ),
            clear_lease: TaskQueue::new(
                QueueConfig::new("clearLease").timeout(t.stop_timeout() + t.turn_on_budget() * 2),
                activity.clone(),
            ),
            query_status: TaskQueue::new(
                QueueConfig::new("queryStatus").timeout(config.query_budget()),
                activity.clone(),
            ),
            change_pause: TaskQueue::new(
                QueueConfig::new("changePause")
                    .debounce(t.debounce())
                    .timeout(t.message_timeout() + config.query_budget()),
                activity.clone(),
            ),
            config,
            platform,
            link,
            leases,
            store,
            activity,
            sessions: EventBus::seeded(core.snapshot()),
            statuses: EventBus::state(),
            errors: EventBus::stream(),
            core: Mutex::new(core),
            tasks: TaskGroup::new("tunnel"),
        });
        controller.register_handlers();
        controller
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.turn_on.set_handler(move |_: ()| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_turn_on().await }
        });

        let weak = Arc::downgrade(self);
        self.turn_off.set_handler(move |_: ()| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_turn_off().await }
        });

        let weak = Arc::downgrade(self);
        self.change_gateway.set_handler(move |gateway: Gateway| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_change_gateway(gateway).await }
        });

        let weak = Arc::downgrade(self);
        self.clear_lease.set_handler(move |_: ()| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_clear_lease().await }
        });

        let weak = Arc::downgrade(self);
        self.query_status.set_handler(move |_: ()| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_query_status().await }
        });

        let weak = Arc::downgrade(self);
        self.change_pause.set_handler(move |until: Option<SystemTime>| {
            let controller = weak.clone();
            async move { upgrade(&controller)?.do_change_pause(until).await }
        });
    }

    /// Listen to the platform and hook into the lease manager
    pub fn start(self: &Arc<Self>) {
        let revoker: Weak<dyn LeaseRevoker> = Arc::downgrade(self) as Weak<Self>;
        self.leases.set_revoker(revoker);
        self.leases.start();

        let mut notifications = self.platform.status_notifications();
        let weak = Arc::downgrade(self);
        self.tasks.spawn("status", async move {
            while let Some(notification) = notifications.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.project(notification);
            }
            debug!("Status listener finished");
        });
    }

    /// Re-drive `turn_on` if the tunnel was on when the process last ran
    pub async fn restore(&self) -> Result<(), TunnelError> {
        let session = self
            .store
            .load()
            .map_err(|e| TunnelError::Internal(format!("could not load session: {}", e)))?;

        if session.tunnel_enabled {
            info!("Tunnel was enabled, restoring");
            self.turn_on().await
        } else {
            Ok(())
        }
    }

    pub async fn turn_on(&self) -> Result<(), TunnelError> {
        Ok(self.turn_on.send(()).await?)
    }

    pub async fn turn_off(&self) -> Result<(), TunnelError> {
        Ok(self.turn_off.send(()).await?)
    }

    /// Route through `gateway`, which must match the current lease.
    ///
    /// A running tunnel is reconfigured in place; otherwise the tunnel is
    /// turned on with the new configuration.
    pub async fn change_gateway(&self, gateway: Gateway) -> Result<(), TunnelError> {
        Ok(self.change_gateway.send(gateway).await?)
    }

    /// Lease `gateway` and switch to it
    pub async fn select_gateway(&self, gateway: Gateway) -> Result<(), TunnelError> {
        self.leases.create_lease(gateway.clone()).await?;
        self.change_gateway(gateway).await
    }

    /// Drop lease, gateway and the VPN flag. A running tunnel is restarted
    /// filtering-only.
    pub async fn clear_lease(&self) -> Result<(), TunnelError> {
        Ok(self.clear_lease.send(()).await?)
    }

    pub async fn query_status(&self) -> Result<TunnelStatus, TunnelError> {
        Ok(self.query_status.send(()).await?)
    }

    /// Pause filtering until `until`; `None` unpauses
    pub async fn change_pause(&self, until: Option<SystemTime>) -> Result<TunnelStatus, TunnelError> {
        Ok(self.change_pause.send(until).await?)
    }

    /// HTTP request made from inside the running tunnel
    pub async fn request(&self, url: &str, method: &str, body: &str) -> Result<String, TunnelError> {
        Ok(self.link.request(url, method, body).await?)
    }

    /// Make sure the device keypair belongs to `account_id`.
    ///
    /// A new account regenerates the pair, which revokes the current lease.
    pub fn on_account_changed(&self, account_id: &str) -> Result<DeviceKeypair, TunnelError> {
        self.leases.ensure_keypair(account_id, &self.config.device_id)
    }

    pub fn leases(&self) -> &Arc<LeaseGatewayManager> {
        &self.leases
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn session(&self) -> TunnelSession {
        self.lock().snapshot()
    }

    pub fn subscribe(&self) -> Subscription<TunnelSession> {
        self.sessions.subscribe()
    }

    pub fn subscribe_status(&self) -> Subscription<TunnelStatus> {
        self.statuses.subscribe()
    }

    /// Failures nobody asked for, like the platform dropping the tunnel
    pub fn subscribe_errors(&self) -> Subscription<TunnelError> {
        self.errors.subscribe()
    }

    pub fn shutdown(&self) {
        self.tasks.shutdown();
        self.turn_on.shutdown();
        self.turn_off.shutdown();
        self.change_gateway.shutdown();
        self.clear_lease.shutdown();
        self.query_status.shutdown();
        self.change_pause.shutdown();
        self.leases.shutdown();
    }

    async fn do_turn_on(self: Arc<Self>) -> Result<(), TunnelError> {
        match self.state() {
            SessionState::Active => {
                debug!("Tunnel already active");
                return Ok(());
            }
            state if state.is_transitional() => return Err(TunnelError::Busy),
            _ => {}
        }

        if !self.platform.has_permission().await {
            warn!("VPN permission missing");
            self.set_state(SessionState::NoPermission);
            self.set_state(SessionState::Off);
            return Err(TunnelError::NoPermission);
        }

        let attempt = self.begin(SessionState::Activating)?;
        let guard = TransitionGuard::new(&self, "turnOn");
        self.remember_enabled(true);

        let result = self.activate(attempt).await;
        self.settle(&result);
        guard.disarm();
        result
    }

    /// Enable, save and start; `Active` once the platform confirms
    async fn activate(&self, attempt: u64) -> Result<(), TunnelError> {
        let notifications = self.platform.status_notifications();

        self.platform.enable().await?;
        if let Err(e) = self.platform.set_on_demand(true).await {
            warn!("Could not enable on-demand: {}", e);
        }
        self.platform.save_configuration(self.tunnel_config(), attempt).await?;

        self.start_tunnel(attempt, notifications).await
    }

    /// Start with retries. `first_attempt` is the id of the first start call.
    async fn start_tunnel(
        &self,
        first_attempt: u64,
        mut notifications: Subscription<StatusNotification>,
    ) -> Result<(), TunnelError> {
        let timing = self.config.timing;
        let mut attempt = first_attempt;

        for n in 0..=timing.start_retries {
            if n > 0 {
                attempt = self.next_attempt(true);
                info!("Retrying start ({}/{})", n, timing.start_retries);
            }

            self.platform.start(attempt).await?;
            let connected = notifications.wait_for(|s| s.generation >= attempt && s.status.is_active());

            match timeout(timing.start_timeout(), connected).await {
                Ok(Some(_)) => {
                    info!("Tunnel active");
                    self.finish(attempt, SessionState::Active);
                    self.verify_lease();
                    return Ok(());
                }
                Ok(None) => return Err(TunnelError::Internal("platform notifications closed".into())),
                Err(_) => warn!("Start not confirmed within {:?}", timing.start_timeout()),
            }
        }

        error!("Tunnel did not start, giving up");
        // Late confirmations of the abandoned starts must not count
        let attempt = self.next_attempt(false);
        if let Err(e) = self.platform.remove_configuration().await {
            warn!("Could not remove VPN profile: {}", e);
        }
        self.finish(attempt, SessionState::Error(ErrorReason::RetryLimitReached));
        Err(TunnelError::Timeout("turnOn".into()))
    }

    async fn do_turn_off(self: Arc<Self>) -> Result<(), TunnelError> {
        match self.state() {
            SessionState::Off => {
                debug!("Tunnel already off");
                return Ok(());
            }
            SessionState::NoPermission => {
                self.set_state(SessionState::Off);
                return Ok(());
            }
            state if state.is_transitional() => return Err(TunnelError::Busy),
            _ => {}
        }

        let attempt = self.begin(SessionState::Deactivating)?;
        let guard = TransitionGuard::new(&self, "turnOff");
        self.remember_enabled(false);

        let notifications = self.platform.status_notifications();
        if let Err(e) = self.platform.set_on_demand(false).await {
            warn!("Could not disable on-demand, stopping anyway: {}", e);
        }
        self.stop_tunnel(attempt, notifications).await;
        if let Err(e) = self.platform.disable().await {
            warn!("Could not disable VPN profile: {}", e);
        }

        self.finish(attempt, SessionState::Off);
        guard.disarm();
        Ok(())
    }

    /// Stop and wait for the platform. A stop that is never confirmed
    /// counts as done.
    async fn stop_tunnel(&self, attempt: u64, mut notifications: Subscription<StatusNotification>) {
        let stop_timeout = self.config.timing.stop_timeout();
        self.platform.stop(attempt).await;

        let stopped = notifications.wait_for(|s| s.generation >= attempt && s.status.is_down());
        match timeout(stop_timeout, stopped).await {
            Ok(_) => info!("Tunnel stopped"),
            Err(_) => warn!("Stop not confirmed within {:?}, assuming stopped", stop_timeout),
        }
    }

    async fn do_change_gateway(self: Arc<Self>, gateway: Gateway) -> Result<(), TunnelError> {
        if self.state().is_transitional() {
            return Err(TunnelError::Busy);
        }

        let keypair = self
            .leases
            .current_keypair()
            .ok_or_else(|| TunnelError::config_missing("device keypair"))?;
        let lease = self
            .leases
            .current_lease()
            .ok_or_else(|| TunnelError::config_missing("lease"))?;
        let config = TunnelConfig::new(
            &keypair,
            gateway,
            lease,
            &self.config.user_agent,
            &self.config.device_tag,
        )?;

        info!("Switching to {}", config.gateway.nice_name());
        let was_enabled = self.lock().vpn_enabled;
        self.set_vpn_enabled(true);

        let result = if self.state() == SessionState::Active {
            self.hot_swap(config).await
        } else {
            self.clone().do_turn_on().await
        };
        if result.is_err() && !was_enabled {
            self.set_vpn_enabled(false);
        }
        result
    }

    /// Reconfigure the running tunnel without restarting it
    async fn hot_swap(self: &Arc<Self>, config: TunnelConfig) -> Result<(), TunnelError> {
        let attempt = self.begin(SessionState::Activating)?;
        let guard = TransitionGuard::new(self, "changeGateway");

        let result = self.swap_gateway(attempt, &config).await;
        if result.is_err() {
            // The tunnel keeps running on the previous configuration
            self.finish(attempt, SessionState::Active);
        }
        guard.disarm();
        result
    }

    async fn swap_gateway(&self, attempt: u64, config: &TunnelConfig) -> Result<(), TunnelError> {
        self.platform.save_configuration(Some(config.clone()), attempt).await?;

        if !self.routes_through(attempt, config) {
            info!("Gateway cleared during switch, restarting without gateway");
            return self.restart_filtering_only(attempt).await;
        }

        self.link.connect(config).await?;
        self.finish(attempt, SessionState::Active);
        self.verify_lease();
        Ok(())
    }

    /// Whether `config` still describes the session after an await
    fn routes_through(&self, attempt: u64, config: &TunnelConfig) -> bool {
        {
            let core = self.lock();
            if core.attempt_id != attempt || !core.vpn_enabled {
                return false;
            }
        }
        self.leases.current_lease().as_ref() == Some(&config.lease)
    }

    async fn do_clear_lease(self: Arc<Self>) -> Result<(), TunnelError> {
        self.settled().await;
        self.leases.forget_lease();
        self.set_vpn_enabled(false);

        if self.state() != SessionState::Active {
            return Ok(());
        }

        info!("Restarting tunnel without gateway");
        let attempt = self.begin(SessionState::Activating)?;
        let guard = TransitionGuard::new(&self, "clearLease");

        let result = self.restart_filtering_only(attempt).await;
        self.settle(&result);
        guard.disarm();
        result
    }

    /// Wait until no transition is in flight
    async fn settled(&self) {
        let mut sessions = self.sessions.subscribe();
        if !self.state().is_transitional() {
            return;
        }
        debug!("Waiting for the running transition to end");
        sessions.wait_for(|s| !s.state.is_transitional()).await;
    }

    async fn restart_filtering_only(&self, attempt: u64) -> Result<(), TunnelError> {
        self.platform.save_configuration(None, attempt).await?;
        self.stop_tunnel(attempt, self.platform.status_notifications()).await;

        let notifications = self.platform.status_notifications();
        let attempt = self.next_attempt(false);
        self.start_tunnel(attempt, notifications).await
    }

    async fn do_query_status(self: Arc<Self>) -> Result<TunnelStatus, TunnelError> {
        let current = self.platform.current_status();
        let pause_seconds = if current.status.is_active() {
            self.link.report().await?
        } else {
            0
        };

        let gateway_id = if self.lock().vpn_enabled {
            self.leases.current_gateway().map(|g| g.id())
        } else {
            None
        };

        let status = TunnelStatus {
            active: current.status.is_active(),
            in_progress: current.status.is_in_progress(),
            gateway_id,
            pause_seconds,
        };
        self.statuses.publish(status.clone());
        Ok(status)
    }

    async fn do_change_pause(self: Arc<Self>, until: Option<SystemTime>) -> Result<TunnelStatus, TunnelError> {
        let seconds = until
            .and_then(|until| until.duration_since(SystemTime::now()).ok())
            .map(|left| left.as_secs_f64().round() as u64)
            .unwrap_or(0);

        if seconds > 0 {
            info!("Pausing for {}s", seconds);
        } else {
            info!("Unpausing");
        }
        self.link.pause(seconds).await?;
        Ok(self.query_status.send(()).await?)
    }

    /// Apply a platform notification to the session
    fn project(&self, notification: StatusNotification) {
        let mut core = self.lock();
        if notification.generation < core.attempt_id {
            debug!(
                "Dropping stale {:?} (generation {} < {})",
                notification.status, notification.generation, core.attempt_id
            );
            return;
        }

        let next = match (&core.state, notification.status) {
            (SessionState::Active, PlatformStatus::Connected) => None,
            (SessionState::Deactivating, PlatformStatus::Connected) => None,
            (_, PlatformStatus::Connected) => Some(SessionState::Active),
            (SessionState::Active, status) if status.is_down() => {
                warn!("Tunnel stopped unexpectedly");
                self.errors.publish(TunnelError::UnexpectedStop);
                self.activity.publish(ComponentEvent::error(
                    TUNNEL_COMPONENT,
                    ErrorClass::Failure,
                    Severity::Major,
                    TunnelError::UnexpectedStop.to_string(),
                ));
                Some(SessionState::Off)
            }
            (SessionState::Deactivating, status) if status.is_down() => Some(SessionState::Off),
            _ => None,
        };

        if let Some(state) = next {
            debug!("Platform {:?} -> {:?}", notification.status, state);
            core.state = state;
            self.sessions.publish(core.snapshot());
        }
    }

    /// Enter a transition with a fresh attempt id
    fn begin(&self, state: SessionState) -> Result<u64, TunnelError> {
        let mut core = self.lock();
        if core.state.is_transitional() {
            return Err(TunnelError::Busy);
        }
        core.attempt_id += 1;
        core.retry_count = 0;
        core.state = state;
        self.sessions.publish(core.snapshot());
        Ok(core.attempt_id)
    }

    fn next_attempt(&self, retry: bool) -> u64 {
        let mut core = self.lock();
        core.attempt_id += 1;
        if retry {
            core.retry_count += 1;
        }
        self.sessions.publish(core.snapshot());
        core.attempt_id
    }

    /// End a transition unless a newer attempt took over
    fn finish(&self, attempt: u64, state: SessionState) {
        let mut core = self.lock();
        if core.attempt_id != attempt {
            debug!("Attempt {} superseded by {}", attempt, core.attempt_id);
            return;
        }
        core.state = state;
        self.sessions.publish(core.snapshot());
    }

    /// Turn a failed transition into a terminal state
    fn settle(&self, result: &Result<(), TunnelError>) {
        if let Err(e) = result {
            let mut core = self.lock();
            if core.state == SessionState::Activating {
                warn!("Activation failed: {}", e);
                core.state = SessionState::Error(ErrorReason::Failed(e.clone()));
                self.sessions.publish(core.snapshot());
            }
        }
    }

    /// Reset a transition whose handler was torn down mid-way
    fn abandon(&self, operation: &str) {
        let mut core = self.lock();
        let state = match core.state {
            SessionState::Activating => {
                SessionState::Error(ErrorReason::Failed(TunnelError::Timeout(operation.to_string())))
            }
            SessionState::Deactivating => SessionState::Off,
            _ => return,
        };
        warn!("{} abandoned, session now {:?}", operation, state);
        core.state = state;
        self.sessions.publish(core.snapshot());
    }

    fn set_state(&self, state: SessionState) {
        let mut core = self.lock();
        core.state = state;
        self.sessions.publish(core.snapshot());
    }

    fn set_vpn_enabled(&self, enabled: bool) {
        {
            let mut core = self.lock();
            core.vpn_enabled = enabled;
            self.sessions.publish(core.snapshot());
        }
        if let Err(e) = self.store.update(&mut |s| s.vpn_enabled = enabled) {
            warn!("Could not persist VPN flag: {}", e);
        }
    }

    fn remember_enabled(&self, enabled: bool) {
        if let Err(e) = self.store.update(&mut |s| s.tunnel_enabled = enabled) {
            warn!("Could not persist tunnel flag: {}", e);
        }
    }

    /// Gateway configuration, or `None` for filtering only
    fn tunnel_config(&self) -> Option<TunnelConfig> {
        if !self.lock().vpn_enabled {
            return None;
        }

        let snapshot = self.leases.snapshot();
        let keypair = self.leases.current_keypair()?;
        let (gateway, lease) = (snapshot.gateway?, snapshot.lease?);
        TunnelConfig::new(&keypair, gateway, lease, &self.config.user_agent, &self.config.device_tag)
            .inspect_err(|e| warn!("Gateway configuration unusable, filtering only: {}", e))
            .ok()
    }

    /// Check the lease in the background; a failure never touches the tunnel
    fn verify_lease(&self) {
        if !self.lock().vpn_enabled {
            return;
        }
        let leases = self.leases.clone();
        self.tasks.spawn("verifyLease", async move {
            if let Err(e) = leases.check_lease().await {
                warn!("Lease check failed: {}", e);
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LeaseRevoker for TunnelSessionController {
    fn revoke_lease(&self, reason: &str) {
        info!("Lease revoked ({}), clearing", reason);
        self.clear_lease.fire(());
    }
}

impl Drop for TunnelSessionController {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

/// Resets the session if a transition handler is dropped before it ends
/// (the queue timed it out and aborted it).
struct TransitionGuard {
    controller: Arc<TunnelSessionController>,
    operation: &'static str,
    armed: bool,
}

impl TransitionGuard {
    fn new(controller: &Arc<TunnelSessionController>, operation: &'static str) -> Self {
        Self {
            controller: controller.clone(),
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.controller.abandon(self.operation);
        }
    }
}

fn upgrade(
    controller: &Weak<TunnelSessionController>,
) -> Result<Arc<TunnelSessionController>, TunnelError> {
    controller
        .upgrade()
        .ok_or_else(|| TunnelError::Internal("tunnel controller dropped".into()))
}
