//! Per-user, per-device connection registry.
//!
//! The outer map is keyed by conn key (`{biz}:{user}`); each entry holds a
//! small per-user device map behind its own short lock, since one user has at
//! most a handful of devices. A second connection from the same device
//! preempts the first (last writer wins).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use session::{Device, Session, User};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wire::{BoxedIo, DeflateState};

use crate::conn::{ConnOptions, Connection};
use crate::error::Result;

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection manager settings; the per-connection options are derived from
/// these at connection creation.
#[derive(Debug, Clone)]
pub struct ConnManagerConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub init_retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub max_retry_count: u32,

    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,

    /// How long graceful shutdown waits for connections to drain.
    pub close_timeout: Duration,
    pub rate_limit: u32,

    /// Idle cutoff for connections that opted into auto close.
    pub idle_timeout: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            read_timeout: crate::conn::DEFAULT_READ_TIMEOUT,
            write_timeout: crate::conn::DEFAULT_WRITE_TIMEOUT,
            init_retry_interval: crate::conn::DEFAULT_INIT_RETRY_INTERVAL,
            max_retry_interval: crate::conn::DEFAULT_MAX_RETRY_INTERVAL,
            max_retry_count: crate::conn::DEFAULT_MAX_RETRY_COUNT,
            send_buffer_size: crate::conn::DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: crate::conn::DEFAULT_RECEIVE_BUFFER_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            rate_limit: crate::conn::DEFAULT_RATE_LIMIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Devices of one user. A plain map under a short lock; at most 3 entries.
struct DeviceConns {
    conns: RwLock<HashMap<Device, Arc<Connection>>>,
}

impl DeviceConns {
    fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::with_capacity(3)),
        }
    }

    fn add(&self, device: Device, conn: Arc<Connection>) {
        self.conns.write().unwrap().insert(device, conn);
    }

    fn remove(&self, device: Device) -> Option<Arc<Connection>> {
        self.conns.write().unwrap().remove(&device)
    }

    /// Remove only when the registered connection is this exact instance.
    fn remove_exact(&self, device: Device, expected: &Arc<Connection>) -> Option<Arc<Connection>> {
        let mut conns = self.conns.write().unwrap();
        match conns.get(&device) {
            Some(existing) if Arc::ptr_eq(existing, expected) => conns.remove(&device),
            _ => None,
        }
    }

    fn find(&self, device: Device) -> Option<Arc<Connection>> {
        self.conns.read().unwrap().get(&device).cloned()
    }

    fn find_all(&self) -> Vec<Arc<Connection>> {
        self.conns.read().unwrap().values().cloned().collect()
    }

    fn clear(&self) -> Vec<Arc<Connection>> {
        self.conns.write().unwrap().drain().map(|(_, c)| c).collect()
    }

    fn is_empty(&self) -> bool {
        self.conns.read().unwrap().is_empty()
    }
}

/// Registry of live connections; the sole authority for lookup and removal.
pub struct ConnManager {
    cfg: ConnManagerConfig,
    conns: DashMap<String, Arc<DeviceConns>>,
    conn_cnt: AtomicI64,
    user_cnt: AtomicI64,
}

impl ConnManager {
    pub fn new(cfg: ConnManagerConfig) -> Self {
        Self {
            cfg,
            conns: DashMap::new(),
            conn_cnt: AtomicI64::new(0),
            user_cnt: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &ConnManagerConfig {
        &self.cfg
    }

    /// Register a new connection for the session's user, preempting any
    /// existing connection on the same device.
    pub fn new_conn(
        &self,
        parent: &CancellationToken,
        io: BoxedIo,
        session: Session,
        deflate: Option<DeflateState>,
    ) -> Result<Arc<Connection>> {
        let user = session.user().clone();
        let conn_key = user.conn_key();

        if self.find_conn(&user).is_some() {
            info!(
                conn_key = %conn_key,
                device = %user.device,
                "existing connection for same device, closing old connection"
            );
            self.remove_conn(&user);
        }

        let conn_id = user.conn_id();
        let opts = self.conn_options(&user, deflate);
        let conn = Connection::spawn(parent, conn_id.clone(), session, io, opts);

        self.store(&conn_key, user.device, conn.clone());
        info!(conn_id = %conn_id, device = %user.device, "connection created");
        Ok(conn)
    }

    fn store(&self, conn_key: &str, device: Device, conn: Arc<Connection>) {
        let devices = self
            .conns
            .entry(conn_key.to_string())
            .or_insert_with(|| {
                self.user_cnt.fetch_add(1, Ordering::SeqCst);
                Arc::new(DeviceConns::new())
            })
            .clone();
        devices.add(device, conn);
        self.conn_cnt.fetch_add(1, Ordering::SeqCst);
    }

    fn conn_options(&self, user: &User, deflate: Option<DeflateState>) -> ConnOptions {
        ConnOptions {
            read_timeout: self.cfg.read_timeout,
            write_timeout: self.cfg.write_timeout,
            init_retry_interval: self.cfg.init_retry_interval,
            max_retry_interval: self.cfg.max_retry_interval,
            max_retry_count: self.cfg.max_retry_count,
            send_buffer_size: self.cfg.send_buffer_size,
            receive_buffer_size: self.cfg.receive_buffer_size,
            rate_limit: self.cfg.rate_limit,
            auto_close: user.auto_close,
            deflate,
        }
    }

    /// Remove and close one device's connection. Returns false when there was
    /// nothing to remove.
    pub fn remove_conn(&self, user: &User) -> bool {
        let conn_key = user.conn_key();
        let Some(devices) = self.conns.get(&conn_key).map(|e| e.value().clone()) else {
            return false;
        };
        let Some(conn) = devices.remove(user.device) else {
            return false;
        };
        self.finish_remove(&conn_key, &devices, conn);
        true
    }

    /// Remove one specific connection instance. A no-op when a newer
    /// connection has already taken the `(user, device)` slot, so a preempted
    /// connection's teardown cannot deregister its replacement.
    pub fn remove_conn_exact(&self, user: &User, conn: &Arc<Connection>) -> bool {
        let conn_key = user.conn_key();
        let Some(devices) = self.conns.get(&conn_key).map(|e| e.value().clone()) else {
            return false;
        };
        let Some(conn) = devices.remove_exact(user.device, conn) else {
            return false;
        };
        self.finish_remove(&conn_key, &devices, conn);
        true
    }

    fn finish_remove(&self, conn_key: &str, devices: &DeviceConns, conn: Arc<Connection>) {
        self.conn_cnt.fetch_sub(1, Ordering::SeqCst);
        if devices.is_empty()
            && self
                .conns
                .remove_if(conn_key, |_, entry| entry.is_empty())
                .is_some()
        {
            self.user_cnt.fetch_sub(1, Ordering::SeqCst);
        }

        conn.close();
        info!(conn_id = %conn.id(), "connection removed");
    }

    /// Remove and close every device of a user.
    pub fn remove_user_conn(&self, user: &User) -> bool {
        let Some((_, devices)) = self.conns.remove(&user.conn_key()) else {
            return false;
        };
        self.user_cnt.fetch_sub(1, Ordering::SeqCst);

        let removed = devices.clear();
        self.conn_cnt
            .fetch_sub(removed.len() as i64, Ordering::SeqCst);
        for conn in removed {
            conn.close();
        }
        true
    }

    pub fn find_conn(&self, user: &User) -> Option<Arc<Connection>> {
        self.conns.get(&user.conn_key())?.find(user.device)
    }

    /// Every live connection of a user, across devices.
    pub fn find_user_conn(&self, user: &User) -> Option<Vec<Arc<Connection>>> {
        let conns = self.conns.get(&user.conn_key())?.find_all();
        (!conns.is_empty()).then_some(conns)
    }

    pub fn conn_count(&self) -> i64 {
        self.conn_cnt.load(Ordering::SeqCst)
    }

    pub fn user_count(&self) -> i64 {
        self.user_cnt.load(Ordering::SeqCst)
    }

    /// Periodically close connections that opted into auto close and have
    /// been idle past the configured cutoff.
    pub fn start_idle_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let manager = self;
        let period = (manager.cfg.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => manager.reap_idle(),
                }
            }
        });
    }

    fn reap_idle(&self) {
        let mut stale = Vec::new();
        for entry in self.conns.iter() {
            for conn in entry.value().find_all() {
                if conn.auto_close() && conn.last_activity().elapsed() > self.cfg.idle_timeout {
                    stale.push(conn);
                }
            }
        }
        for conn in stale {
            warn!(conn_id = conn.id(), "closing idle connection");
            let user = conn.user().clone();
            self.remove_conn_exact(&user, &conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{KvStore, MemoryStore, SessionStore};

    fn manager() -> Arc<ConnManager> {
        Arc::new(ConnManager::new(ConnManagerConfig::default()))
    }

    async fn session_for(user: &User) -> Session {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        SessionStore::new(store).build(user).await.unwrap().0
    }

    fn user(biz: u64, uid: u64, device: Device) -> User {
        User {
            biz_id: biz,
            user_id: uid,
            device,
            auto_close: false,
        }
    }

    /// The client half is returned so tests keep the stream open; dropping it
    /// would EOF the connection.
    async fn add_conn(
        manager: &ConnManager,
        token: &CancellationToken,
        u: &User,
    ) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let session = session_for(u).await;
        let conn = manager
            .new_conn(token, Box::new(server), session, None)
            .unwrap();
        (conn, client)
    }

    #[tokio::test]
    async fn counters_track_distinct_devices_and_users() {
        let manager = manager();
        let token = CancellationToken::new();

        let _a = add_conn(&manager, &token, &user(1, 42, Device::Mobile)).await;
        let _b = add_conn(&manager, &token, &user(1, 42, Device::Pc)).await;
        let _c = add_conn(&manager, &token, &user(1, 7, Device::Mobile)).await;

        assert_eq!(manager.conn_count(), 3);
        assert_eq!(manager.user_count(), 2);
    }

    #[tokio::test]
    async fn same_device_preempts_old_connection() {
        let manager = manager();
        let token = CancellationToken::new();
        let u = user(1, 42, Device::Mobile);

        let (first, _first_io) = add_conn(&manager, &token, &u).await;
        let (second, _second_io) = add_conn(&manager, &token, &u).await;

        first.closed().await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.conn_count(), 1);
        assert_eq!(manager.user_count(), 1);

        let found = manager.find_conn(&u).unwrap();
        assert_eq!(found.id(), second.id());
    }

    #[tokio::test]
    async fn remove_conn_updates_counters_and_closes() {
        let manager = manager();
        let token = CancellationToken::new();
        let u = user(1, 42, Device::Tablet);

        let (conn, _io) = add_conn(&manager, &token, &u).await;
        assert!(manager.remove_conn(&u));
        assert!(!manager.remove_conn(&u));

        conn.closed().await;
        assert_eq!(manager.conn_count(), 0);
        assert_eq!(manager.user_count(), 0);
        assert!(manager.find_conn(&u).is_none());
    }

    #[tokio::test]
    async fn remove_user_conn_clears_all_devices() {
        let manager = manager();
        let token = CancellationToken::new();

        let _a = add_conn(&manager, &token, &user(1, 42, Device::Mobile)).await;
        let _b = add_conn(&manager, &token, &user(1, 42, Device::Pc)).await;

        assert!(manager.remove_user_conn(&user(1, 42, Device::Unknown)));
        assert_eq!(manager.conn_count(), 0);
        assert_eq!(manager.user_count(), 0);
    }

    #[tokio::test]
    async fn remove_conn_exact_spares_a_replacement() {
        let manager = manager();
        let token = CancellationToken::new();
        let u = user(1, 42, Device::Mobile);

        let (first, _first_io) = add_conn(&manager, &token, &u).await;
        let (second, _second_io) = add_conn(&manager, &token, &u).await;

        // The preempted connection's teardown must not deregister the new
        // connection occupying the same slot.
        assert!(!manager.remove_conn_exact(&u, &first));
        assert_eq!(manager.conn_count(), 1);
        assert!(!second.is_closed());

        assert!(manager.remove_conn_exact(&u, &second));
        assert_eq!(manager.conn_count(), 0);
    }

    #[tokio::test]
    async fn find_user_conn_returns_all_devices() {
        let manager = manager();
        let token = CancellationToken::new();

        let _a = add_conn(&manager, &token, &user(1, 42, Device::Mobile)).await;
        let _b = add_conn(&manager, &token, &user(1, 42, Device::Pc)).await;

        let conns = manager.find_user_conn(&user(1, 42, Device::Unknown)).unwrap();
        assert_eq!(conns.len(), 2);

        assert!(manager.find_user_conn(&user(9, 9, Device::Unknown)).is_none());
    }
}
