//! Lease/gateway negotiation
//!
//! [`LeaseGatewayManager`] is the only writer of the device keypair, the
//! selected gateway and the lease. Readers get copies through
//! [`LeaseGatewayManager::snapshot`] or the snapshot bus.
//!
//! # Queues
//!
//! | Queue | Work |
//! |-------|------|
//! | `newLease` | register the device key with a gateway |
//! | `checkLease` | verify the current lease server-side |
//! | `loadGateways` | fetch the gateway list (cached) |
//! | `deleteLease` | remove a lease server-side |
//!
//! A lease that turns out to be dead is handed to the registered
//! [`LeaseRevoker`] (the tunnel controller), so the session never keeps
//! presenting itself as connected through it.

use crate::backend::{LeaseBackend, LeaseRequest};
use crate::config::{Gateway, Lease};
use crate::error::{BackendError, TunnelError};
use crate::keys::{DeviceKeypair, KeyGenerator, PublicKey};
use crate::store::{PersistedSession, SessionStore};
use netx_runtime::{
    ActivityBus, ComponentEvent, EventBus, QueueConfig, Subscription, TaskGroup, TaskQueue,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Component name used for backend connectivity reports
pub const API_COMPONENT: &str = "api";

/// Drops the lease a session is running on
pub trait LeaseRevoker: Send + Sync {
    fn revoke_lease(&self, reason: &str);
}

/// Copy of what the manager currently holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub public_key: Option<PublicKey>,
    pub gateway: Option<Gateway>,
    pub lease: Option<Lease>,
}

/// Lease manager tuning
#[derive(Debug, Clone)]
pub struct LeaseManagerConfig {
    /// Limit for one backend call
    pub backend_timeout: Duration,
    /// Lease renewal happens this long before expiry
    pub renew_margin: Duration,
    /// Device name shown in the account's device list
    pub alias: Option<String>,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(10),
            renew_margin: Duration::from_secs(60),
            alias: None,
        }
    }
}

#[derive(Default)]
struct LeaseState {
    keypair: Option<DeviceKeypair>,
    gateway: Option<Gateway>,
    lease: Option<Lease>,
}

impl LeaseState {
    fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            public_key: self.keypair.as_ref().map(|k| k.public_key()),
            gateway: self.gateway.clone(),
            lease: self.lease.clone(),
        }
    }
}

/// Negotiates keypair, gateway and lease with the backend
pub struct LeaseGatewayManager {
    config: LeaseManagerConfig,
    backend: Arc<dyn LeaseBackend>,
    store: Arc<dyn SessionStore>,
    keygen: Arc<dyn KeyGenerator>,
    activity: ActivityBus,
    state: Mutex<LeaseState>,
    snapshots: EventBus<LeaseSnapshot>,
    new_lease: TaskQueue<Gateway, Lease, TunnelError>,
    check_lease: TaskQueue<(), (), TunnelError>,
    load_gateways: TaskQueue<(), Vec<Gateway>, TunnelError>,
    delete_lease: TaskQueue<Lease, (), TunnelError>,
    revoker: Mutex<Option<Weak<dyn LeaseRevoker>>>,
    tasks: TaskGroup,
}

impl LeaseGatewayManager {
    /// Create the manager with the persisted keypair, gateway and lease.
    ///
    /// Must be called inside a tokio runtime (queue workers are spawned).
    pub fn new(
        config: LeaseManagerConfig,
        backend: Arc<dyn LeaseBackend>,
        store: Arc<dyn SessionStore>,
        keygen: Arc<dyn KeyGenerator>,
        activity: ActivityBus,
    ) -> Arc<Self> {
        let persisted = store.load().unwrap_or_else(|e| {
            warn!("Could not load session, starting empty: {}", e);
            PersistedSession::default()
        });
        let state = LeaseState {
            keypair: persisted.keypair,
            gateway: persisted.gateway,
            lease: persisted.lease,
        };
        let snapshots = EventBus::seeded(state.snapshot());
        let timeout = config.backend_timeout;

        let manager = Arc::new(Self {
            new_lease: TaskQueue::new(
                QueueConfig::new("newLease").timeout(timeout).major(),
                activity.clone(),
            ),
            check_lease: TaskQueue::new(QueueConfig::new("checkLease").timeout(timeout), activity.clone()),
            load_gateways: TaskQueue::new(
                QueueConfig::new("loadGateways").timeout(timeout),
                activity.clone(),
            ),
            delete_lease: TaskQueue::new(QueueConfig::new("deleteLease").timeout(timeout), activity.clone()),
            config,
            backend,
            store,
            keygen,
            activity,
            state: Mutex::new(state),
            snapshots,
            revoker: Mutex::new(None),
            tasks: TaskGroup::new("leases"),
        });
        manager.register_handlers();
        manager
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.new_lease.set_handler(move |gateway: Gateway| {
            let manager = weak.clone();
            async move { upgrade(&manager)?.do_new_lease(gateway).await }
        });

        let weak = Arc::downgrade(self);
        self.check_lease.set_handler(move |_: ()| {
            let manager = weak.clone();
            async move { upgrade(&manager)?.do_check_lease().await }
        });

        let weak = Arc::downgrade(self);
        self.load_gateways.set_handler(move |_: ()| {
            let manager = weak.clone();
            async move { upgrade(&manager)?.do_load_gateways().await }
        });

        let weak = Arc::downgrade(self);
        self.delete_lease.set_handler(move |lease: Lease| {
            let manager = weak.clone();
            async move { upgrade(&manager)?.do_delete_lease(lease).await }
        });
    }

    /// Arm the expiry watcher for a restored lease
    pub fn start(self: &Arc<Self>) {
        if let Some(lease) = self.current_lease() {
            self.watch_expiry(&lease);
        }
    }

    /// Who to tell when the current lease turns out to be dead
    pub fn set_revoker(&self, revoker: Weak<dyn LeaseRevoker>) {
        *self.revoker.lock().unwrap_or_else(PoisonError::into_inner) = Some(revoker);
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        self.lock().snapshot()
    }

    pub fn subscribe(&self) -> Subscription<LeaseSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn current_keypair(&self) -> Option<DeviceKeypair> {
        self.lock().keypair.clone()
    }

    pub fn current_gateway(&self) -> Option<Gateway> {
        self.lock().gateway.clone()
    }

    pub fn current_lease(&self) -> Option<Lease> {
        self.lock().lease.clone()
    }

    /// Keypair for `(account_id, device_id)`, generating and persisting a new
    /// one when the current pair belongs to something else.
    ///
    /// A regenerated pair invalidates the current lease, which was bound to
    /// the old public key.
    pub fn ensure_keypair(
        self: &Arc<Self>,
        account_id: &str,
        device_id: &str,
    ) -> Result<DeviceKeypair, TunnelError> {
        if let Some(existing) = self.current_keypair() {
            if existing.matches(account_id, device_id) {
                return Ok(existing);
            }
            info!("Account or device changed, regenerating keypair");
        } else {
            info!("No keypair yet, generating");
        }

        let keypair = DeviceKeypair::new(self.keygen.generate(), account_id, device_id);
        self.store
            .update(&mut |s| s.keypair = Some(keypair.clone()))
            .map_err(|e| TunnelError::Internal(format!("could not persist keypair: {}", e)))?;
        self.store.request_backup();

        let stale = {
            let mut state = self.lock();
            state.keypair = Some(keypair.clone());
            state.lease.take()
        };
        if stale.is_some() {
            self.persist();
        }
        self.publish();

        if let Some(stale) = stale {
            self.delete_lease.fire(stale);
            self.revoke("keypair regenerated");
        }

        Ok(keypair)
    }

    /// Register the device key with `gateway` and make it current.
    ///
    /// "Too many devices" is returned as is, never retried.
    pub async fn create_lease(&self, gateway: Gateway) -> Result<Lease, TunnelError> {
        Ok(self.new_lease.send(gateway).await?)
    }

    /// Verify the current lease server-side; a dead lease is revoked
    pub async fn check_lease(&self) -> Result<(), TunnelError> {
        Ok(self.check_lease.send(()).await?)
    }

    /// Gateway list, from cache when already loaded
    pub async fn load_gateways(&self) -> Result<Vec<Gateway>, TunnelError> {
        Ok(self.load_gateways.get().await?)
    }

    /// Fetch the gateway list again
    pub async fn refresh_gateways(&self) -> Result<Vec<Gateway>, TunnelError> {
        Ok(self.load_gateways.send(()).await?)
    }

    /// Remove the current lease server-side and drop it locally
    pub async fn delete_lease(&self) -> Result<(), TunnelError> {
        match self.current_lease() {
            Some(lease) => Ok(self.delete_lease.send(lease).await?),
            None => Ok(()),
        }
    }

    /// Drop gateway and lease locally (no backend call)
    pub fn forget_lease(&self) {
        {
            let mut state = self.lock();
            if state.lease.is_none() && state.gateway.is_none() {
                return;
            }
            state.lease = None;
            state.gateway = None;
        }
        self.tasks.abort("expiry");
        self.persist();
        self.publish();
        info!("Lease cleared");
    }

    pub fn shutdown(&self) {
        self.tasks.shutdown();
        self.new_lease.shutdown();
        self.check_lease.shutdown();
        self.load_gateways.shutdown();
        self.delete_lease.shutdown();
    }

    async fn do_new_lease(self: Arc<Self>, gateway: Gateway) -> Result<Lease, TunnelError> {
        let keypair = self
            .current_keypair()
            .ok_or_else(|| TunnelError::config_missing("device keypair"))?;

        let request = LeaseRequest {
            account_id: keypair.account_id.clone(),
            public_key: keypair.public_key(),
            gateway_id: gateway.public_key,
            alias: self.config.alias.clone(),
        };

        info!("Requesting lease for {}", gateway.nice_name());
        let lease = self.api(self.backend.create_lease(request).await)?;
        self.install(gateway, lease.clone());
        Ok(lease)
    }

    async fn do_check_lease(self: Arc<Self>) -> Result<(), TunnelError> {
        let (keypair, lease) = {
            let state = self.lock();
            (state.keypair.clone(), state.lease.clone())
        };
        let (Some(keypair), Some(lease)) = (keypair, lease) else {
            debug!("No lease to check");
            return Ok(());
        };

        if !lease.is_active() {
            self.revoke("lease expired");
            return Err(TunnelError::config_missing("active lease"));
        }

        let remote = match self.backend.get_lease(&keypair.account_id, &keypair.public_key()).await {
            Ok(remote) => {
                self.report_api(false);
                remote
            }
            Err(BackendError::LeaseNotFound) => {
                self.report_api(false);
                self.revoke("lease rejected by backend");
                return Err(BackendError::LeaseNotFound.into());
            }
            Err(e) => {
                self.report_api(!e.is_definitive());
                return Err(e.into());
            }
        };

        match remote {
            Some(remote) if remote.gateway_id == lease.gateway_id => {
                if remote.expires_at != lease.expires_at {
                    debug!("Lease expiry moved, updating");
                    self.lock().lease = Some(remote.clone());
                    self.persist();
                    self.publish();
                    self.watch_expiry(&remote);
                }
                Ok(())
            }
            _ => {
                self.revoke("lease no longer valid");
                Err(BackendError::LeaseNotFound.into())
            }
        }
    }

    async fn do_load_gateways(self: Arc<Self>) -> Result<Vec<Gateway>, TunnelError> {
        let gateways = self.api(self.backend.list_gateways().await)?;
        debug!("Loaded {} gateways", gateways.len());
        Ok(gateways)
    }

    async fn do_delete_lease(self: Arc<Self>, lease: Lease) -> Result<(), TunnelError> {
        self.api(self.backend.delete_lease(LeaseRequest::for_lease(&lease)).await)?;

        if self.current_lease().as_ref() == Some(&lease) {
            self.revoke("lease deleted");
        }
        Ok(())
    }

    /// Make `lease` on `gateway` current
    fn install(self: &Arc<Self>, gateway: Gateway, lease: Lease) {
        {
            let mut state = self.lock();
            state.gateway = Some(gateway);
            state.lease = Some(lease.clone());
        }
        self.persist();
        self.publish();
        self.watch_expiry(&lease);
    }

    /// Renew `lease` shortly before it expires
    fn watch_expiry(self: &Arc<Self>, lease: &Lease) {
        self.tasks.abort("expiry");

        let renew_in = lease
            .remaining()
            .and_then(|left| left.checked_sub(self.config.renew_margin));
        let Some(renew_in) = renew_in else {
            warn!("Lease is about to expire, dropping it");
            self.delete_lease.fire(lease.clone());
            self.revoke("lease expiring");
            return;
        };

        let weak = Arc::downgrade(self);
        let gateway_id = lease.gateway_id;
        debug!("Lease renewal in {:?}", renew_in);

        self.tasks.spawn("expiry", async move {
            sleep(renew_in).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let Some(gateway) = manager.current_gateway().filter(|g| g.public_key == gateway_id) else {
                return;
            };

            info!("Lease expiring, renewing");
            if let Err(e) = manager.create_lease(gateway).await {
                warn!("Lease renewal failed: {}", e);
                manager.revoke("lease renewal failed");
            }
        });
    }

    fn revoke(&self, reason: &str) {
        let revoker = self
            .revoker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);

        warn!("Revoking lease: {}", reason);
        match revoker {
            Some(revoker) => revoker.revoke_lease(reason),
            None => self.forget_lease(),
        }
    }

    /// Record the connectivity side of a backend result
    fn api<T>(&self, result: Result<T, BackendError>) -> Result<T, TunnelError> {
        match &result {
            Ok(_) => self.report_api(false),
            Err(e) => self.report_api(!e.is_definitive()),
        }
        result.map_err(TunnelError::from)
    }

    fn report_api(&self, issue: bool) {
        self.activity.publish(ComponentEvent::conn_issue(API_COMPONENT, issue));
    }

    fn persist(&self) {
        let (gateway, lease) = {
            let state = self.lock();
            (state.gateway.clone(), state.lease.clone())
        };
        let result = self.store.update(&mut |s| {
            s.gateway = gateway.clone();
            s.lease = lease.clone();
        });
        if let Err(e) = result {
            warn!("Could not persist lease: {}", e);
        }
    }

    fn publish(&self) {
        self.snapshots.publish(self.snapshot());
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LeaseGatewayManager {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

fn upgrade(manager: &Weak<LeaseGatewayManager>) -> Result<Arc<LeaseGatewayManager>, TunnelError> {
    manager
        .upgrade()
        .ok_or_else(|| TunnelError::Internal("lease manager dropped".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::X25519Generator;
    use crate::sim::SimulatedBackend;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct RecordingRevoker {
        reasons: Mutex<Vec<String>>,
    }

    impl LeaseRevoker for RecordingRevoker {
        fn revoke_lease(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    struct Fixture {
        manager: Arc<LeaseGatewayManager>,
        backend: Arc<SimulatedBackend>,
        store: Arc<MemoryStore>,
        revoker: Arc<RecordingRevoker>,
        activity: ActivityBus,
    }

    fn fixture() -> Fixture {
        let backend = SimulatedBackend::with_default_gateways();
        let store = Arc::new(MemoryStore::new());
        let activity = ActivityBus::stream();
        let manager = LeaseGatewayManager::new(
            LeaseManagerConfig::default(),
            backend.clone(),
            store.clone(),
            Arc::new(X25519Generator),
            activity.clone(),
        );

        let revoker = Arc::new(RecordingRevoker::default());
        let weak: Weak<dyn LeaseRevoker> = Arc::downgrade(&revoker) as Weak<RecordingRevoker>;
        manager.set_revoker(weak);

        Fixture {
            manager,
            backend,
            store,
            revoker,
            activity,
        }
    }

    impl Fixture {
        async fn leased(&self) -> (Gateway, Lease) {
            self.manager.ensure_keypair("acc1", "dev1").unwrap();
            let gateway = self.manager.load_gateways().await.unwrap().remove(0);
            let lease = self.manager.create_lease(gateway.clone()).await.unwrap();
            (gateway, lease)
        }

        fn revocations(&self) -> Vec<String> {
            self.revoker.reasons.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_keypair_kept_for_same_account() {
        let f = fixture();
        let first = f.manager.ensure_keypair("acc1", "dev1").unwrap();
        let again = f.manager.ensure_keypair("acc1", "dev1").unwrap();

        assert_eq!(first, again);
        assert_eq!(f.store.backup_requests(), 1);
        assert_eq!(f.store.snapshot().keypair, Some(first));
    }

    #[tokio::test]
    async fn test_account_change_regenerates_and_invalidates_lease() {
        let f = fixture();
        let (_, lease) = f.leased().await;

        let fresh = f.manager.ensure_keypair("acc2", "dev1").unwrap();
        assert_ne!(fresh.public_key(), lease.public_key);
        assert!(f.manager.current_lease().is_none());
        assert!(f.store.snapshot().lease.is_none());
        assert_eq!(f.store.backup_requests(), 2);
        assert_eq!(f.revocations(), vec!["keypair regenerated".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_new_lease() {
        let f = fixture();
        f.manager.ensure_keypair("acc1", "dev1").unwrap();
        let gateway = f.manager.load_gateways().await.unwrap().remove(0);
        let mut events = f.activity.subscribe();
        f.backend.set_delay(Duration::from_secs(15));

        let err = f.manager.create_lease(gateway).await.unwrap_err();
        assert_eq!(err, TunnelError::Timeout("newLease".into()));
        assert!(f.manager.current_lease().is_none());
        assert!(f.backend.leases().is_empty());

        let timeouts = events
            .drain()
            .into_iter()
            .filter(|e| e.component == "newLease")
            .filter(|e| {
                matches!(
                    e.kind,
                    netx_runtime::EventKind::Error {
                        class: netx_runtime::ErrorClass::Timeout,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(timeouts, 1);
    }

    #[tokio::test]
    async fn test_create_lease_requires_keypair() {
        let f = fixture();
        let gateway = f.manager.load_gateways().await.unwrap().remove(0);

        let err = f.manager.create_lease(gateway).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConfigMissing(_)));
    }

    #[tokio::test]
    async fn test_too_many_devices_is_not_retried() {
        let f = fixture();
        f.manager.ensure_keypair("acc1", "dev1").unwrap();
        f.backend.set_max_devices(0);
        let gateway = f.manager.load_gateways().await.unwrap().remove(0);

        let err = f.manager.create_lease(gateway).await.unwrap_err();
        assert_eq!(err, TunnelError::Backend(BackendError::TooManyDevices));
        assert_eq!(f.backend.calls("create_lease"), 1);
        assert!(f.manager.current_lease().is_none());
    }

    #[tokio::test]
    async fn test_lease_is_persisted_and_published() {
        let f = fixture();
        let mut snapshots = f.manager.subscribe();
        let (gateway, lease) = f.leased().await;

        let persisted = f.store.snapshot();
        assert_eq!(persisted.lease, Some(lease.clone()));
        assert_eq!(persisted.gateway, Some(gateway.clone()));

        let last = snapshots.drain().pop().unwrap();
        assert_eq!(last.lease, Some(lease));
        assert_eq!(last.gateway, Some(gateway));
    }

    #[tokio::test]
    async fn test_gateways_are_cached() {
        let f = fixture();
        f.manager.load_gateways().await.unwrap();
        f.manager.load_gateways().await.unwrap();
        assert_eq!(f.backend.calls("list_gateways"), 1);

        f.manager.refresh_gateways().await.unwrap();
        assert_eq!(f.backend.calls("list_gateways"), 2);
    }

    #[tokio::test]
    async fn test_check_lease_ok() {
        let f = fixture();
        f.leased().await;

        f.manager.check_lease().await.unwrap();
        assert!(f.revocations().is_empty());
    }

    #[tokio::test]
    async fn test_dead_lease_is_revoked() {
        let f = fixture();
        f.leased().await;
        f.backend.drop_all_leases();

        let err = f.manager.check_lease().await.unwrap_err();
        assert_eq!(err, TunnelError::Backend(BackendError::LeaseNotFound));
        assert_eq!(f.revocations(), vec!["lease no longer valid".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_backend_does_not_revoke() {
        let f = fixture();
        let mut events = f.activity.subscribe();
        f.leased().await;
        f.backend.fail_with(Some(BackendError::Network("offline".into())));

        assert!(f.manager.check_lease().await.is_err());
        assert!(f.revocations().is_empty());
        assert!(
            events
                .drain()
                .iter()
                .any(|e| e.kind == netx_runtime::EventKind::ConnIssue(true))
        );
    }

    #[tokio::test]
    async fn test_delete_lease_revokes_current() {
        let f = fixture();
        f.leased().await;

        f.manager.delete_lease().await.unwrap();
        assert!(f.backend.leases().is_empty());
        assert_eq!(f.revocations(), vec!["lease deleted".to_string()]);
    }

    #[tokio::test]
    async fn test_forget_without_revoker_clears_state() {
        let backend = SimulatedBackend::with_default_gateways();
        let store = Arc::new(MemoryStore::new());
        let manager = LeaseGatewayManager::new(
            LeaseManagerConfig::default(),
            backend.clone(),
            store.clone(),
            Arc::new(X25519Generator),
            ActivityBus::stream(),
        );
        manager.ensure_keypair("acc1", "dev1").unwrap();
        let gateway = manager.load_gateways().await.unwrap().remove(0);
        manager.create_lease(gateway).await.unwrap();

        backend.drop_all_leases();
        assert!(manager.check_lease().await.is_err());
        assert!(manager.current_lease().is_none());
        assert!(store.snapshot().lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_renewed_before_expiry() {
        let f = fixture();
        f.backend.set_lease_duration(Duration::from_secs(120));
        let (_, first) = f.leased().await;

        sleep(Duration::from_secs(65)).await;

        assert_eq!(f.backend.calls("create_lease"), 2);
        let renewed = f.manager.current_lease().unwrap();
        assert_eq!(renewed.gateway_id, first.gateway_id);
        assert!(renewed.expires_at >= first.expires_at);
        assert!(f.revocations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_revokes() {
        let f = fixture();
        f.backend.set_lease_duration(Duration::from_secs(120));
        f.leased().await;
        f.backend.fail_with(Some(BackendError::Http(500)));

        sleep(Duration::from_secs(65)).await;

        assert_eq!(f.revocations(), vec!["lease renewal failed".to_string()]);
    }
}
