//! Mail store connection pool
//!
//! Owns a growable arena of authenticated sessions shared by every request
//! worker. Slots are addressed by opaque integer handles so release and
//! replace are O(1) lookups. The single mutex guards only membership and
//! busy flags; all connecting and probing happens with the lock dropped, so
//! a slow mail store call never blocks other workers' bookkeeping.
//!
//! A checked-out session is physically moved out of its slot: the caller
//! holds the only reference until release, which is the pool's entire
//! isolation mechanism.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::config::ExhaustionPolicy;
use crate::errors::{EngineError, EngineResult};
use crate::store::{Connector, MailStore};

/// Login attempts per connection creation before giving up
const LOGIN_ATTEMPTS: u32 = 10;

/// Opaque handle to a pool slot
///
/// Only ever produced by [`ConnectionPool::acquire`]; callers pass it back
/// to `release` or `replace` and never look inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle {
    index: usize,
}

/// One arena slot
///
/// `busy == true` means the session is checked out and `store` is `None`.
/// An idle slot with no store is a vacancy left by a failed connect; it is
/// re-established by the next acquire or keep-alive sweep. The arena never
/// shrinks, so slot indices stay valid for the pool's lifetime.
struct Slot {
    store: Option<Box<dyn MailStore>>,
    busy: bool,
    conn_id: u64,
}

/// What the locked reservation scan decided
enum Reservation {
    /// An idle session was taken from this slot
    Reuse(usize, Box<dyn MailStore>),
    /// This slot was reserved and needs a fresh session
    Connect(usize),
    /// Pool is at capacity and every session is checked out
    Full,
}

/// Shared, growable pool of authenticated mail store sessions
pub struct ConnectionPool {
    slots: Mutex<Vec<Slot>>,
    connector: Arc<dyn Connector>,
    max_connections: Option<usize>,
    exhaustion_policy: ExhaustionPolicy,
    /// Signalled whenever a slot becomes available again
    released: Notify,
    next_conn_id: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool
    ///
    /// Connections are created lazily, on the first acquire past idle-pool
    /// exhaustion. `max_connections: None` lets the pool grow without bound.
    pub fn new(
        connector: Arc<dyn Connector>,
        max_connections: Option<usize>,
        exhaustion_policy: ExhaustionPolicy,
    ) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            connector,
            max_connections,
            exhaustion_policy,
            released: Notify::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Number of slots in the arena (checked out, idle, and vacant alike)
    pub fn size(&self) -> usize {
        self.lock_slots().len()
    }

    /// Check out a session, creating one if no idle session exists
    ///
    /// The first idle slot is reused before any new connection is made.
    /// Connection creation retries the login up to 10 times, logging each
    /// failure; exhausting the retries is a hard error that callers must not
    /// retry themselves.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` at capacity under the fail-fast policy
    /// - whatever the final login attempt returned, once retries run out
    pub async fn acquire(&self) -> EngineResult<(ConnHandle, Box<dyn MailStore>)> {
        loop {
            let reservation = {
                let mut slots = self.lock_slots();
                let mut found = None;
                for (index, slot) in slots.iter_mut().enumerate() {
                    if slot.busy {
                        continue;
                    }
                    slot.busy = true;
                    found = Some(match slot.store.take() {
                        Some(store) => Reservation::Reuse(index, store),
                        None => Reservation::Connect(index),
                    });
                    break;
                }
                match found {
                    Some(reservation) => reservation,
                    None if self.max_connections.is_none_or(|max| slots.len() < max) => {
                        slots.push(Slot {
                            store: None,
                            busy: true,
                            conn_id: 0,
                        });
                        Reservation::Connect(slots.len() - 1)
                    }
                    None => Reservation::Full,
                }
            };

            match reservation {
                Reservation::Reuse(index, store) => {
                    return Ok((ConnHandle { index }, store));
                }
                Reservation::Connect(index) => {
                    return self.connect_into(index).await;
                }
                Reservation::Full => match self.exhaustion_policy {
                    ExhaustionPolicy::FailFast => return Err(EngineError::PoolExhausted),
                    ExhaustionPolicy::Wait => self.released.notified().await,
                },
            }
        }
    }

    /// Return a checked-out session to its slot
    ///
    /// # Errors
    ///
    /// `Protocol` if the handle does not name a checked-out slot. That is an
    /// invariant violation in the caller: it is logged and fails the current
    /// operation, never the process.
    pub fn release(&self, handle: ConnHandle, store: Box<dyn MailStore>) -> EngineResult<()> {
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(handle.index) else {
            drop(slots);
            tracing::error!(slot = handle.index, "release of an unknown connection handle");
            return Err(EngineError::Protocol(
                "release of an unknown connection handle".to_owned(),
            ));
        };
        if !slot.busy {
            drop(slots);
            tracing::error!(
                slot = handle.index,
                "release of a connection that was not checked out"
            );
            return Err(EngineError::Protocol(
                "release of a connection that was not checked out".to_owned(),
            ));
        }
        slot.store = Some(store);
        slot.busy = false;
        drop(slots);
        self.released.notify_one();
        Ok(())
    }

    /// Replace a checked-out session with a freshly connected one
    ///
    /// The caller drops the old session and takes ownership of the new one;
    /// the slot keeps its busy state throughout. Used after a failed health
    /// probe.
    ///
    /// # Errors
    ///
    /// - `Protocol` if the handle does not name a checked-out slot
    /// - connection errors once the login retries run out
    pub async fn replace(&self, handle: ConnHandle) -> EngineResult<Box<dyn MailStore>> {
        {
            let slots = self.lock_slots();
            let Some(slot) = slots.get(handle.index) else {
                drop(slots);
                tracing::error!(slot = handle.index, "replace of an unknown connection handle");
                return Err(EngineError::Protocol(
                    "replace of an unknown connection handle".to_owned(),
                ));
            };
            if !slot.busy {
                drop(slots);
                tracing::error!(
                    slot = handle.index,
                    "replace of a connection that was not checked out"
                );
                return Err(EngineError::Protocol(
                    "replace of a connection that was not checked out".to_owned(),
                ));
            }
        }

        let store = self.connect_with_retry().await?;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.lock_slots();
        slots[handle.index].conn_id = conn_id;
        Ok(store)
    }

    /// Check out a session that just passed a no-op probe
    ///
    /// A session that fails the probe is replaced transparently; the caller
    /// only ever sees a validated session. The slot is busy before the probe
    /// runs and stays busy until release, so no other acquirer can observe
    /// the session mid-validation.
    pub async fn get_healthy(&self) -> EngineResult<(ConnHandle, Box<dyn MailStore>)> {
        let (handle, mut store) = self.acquire().await?;
        match store.noop().await {
            Ok(()) => Ok((handle, store)),
            Err(probe_err) => {
                tracing::warn!(
                    slot = handle.index,
                    error = %probe_err,
                    "pooled connection failed probe; replacing"
                );
                drop(store);
                match self.replace(handle).await {
                    Ok(fresh) => Ok((handle, fresh)),
                    Err(e) => {
                        self.abandon(handle);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Probe every idle session, replacing dead ones in place
    ///
    /// Best-effort: every failure is swallowed after logging, so one bad
    /// session never aborts the sweep of the rest and nothing propagates to
    /// the sweeper. Vacant slots left by earlier failures are re-established
    /// here too. Each slot is reserved for the duration of its own probe, so
    /// concurrent acquirers never share a session with the sweep.
    pub async fn sweep_idle(&self) {
        let len = self.lock_slots().len();
        for index in 0..len {
            let store = {
                let mut slots = self.lock_slots();
                let Some(slot) = slots.get_mut(index) else {
                    break;
                };
                if slot.busy {
                    continue;
                }
                slot.busy = true;
                slot.store.take()
            };

            match store {
                Some(mut store) => match store.noop().await {
                    Ok(()) => {
                        let mut slots = self.lock_slots();
                        slots[index].store = Some(store);
                        slots[index].busy = false;
                    }
                    Err(e) => {
                        tracing::warn!(
                            slot = index,
                            error = %e,
                            "idle connection failed keep-alive probe; replacing"
                        );
                        drop(store);
                        self.reestablish(index).await;
                    }
                },
                None => self.reestablish(index).await,
            }
            self.released.notify_one();
        }
    }

    /// Run an operation against a validated session, releasing it afterwards
    ///
    /// The scoped acquire/release pattern used by every fan-out worker: the
    /// session goes back to the pool on success and error alike, then the
    /// operation's own result is propagated.
    pub async fn with_session<T>(
        &self,
        op: impl for<'a> FnOnce(&'a mut dyn MailStore) -> BoxFuture<'a, EngineResult<T>> + Send,
    ) -> EngineResult<T> {
        let (handle, mut store) = self.get_healthy().await?;
        let result = op(store.as_mut()).await;
        let released = self.release(handle, store);
        match result {
            Ok(value) => released.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Connect a fresh session into a reserved slot
    ///
    /// On failure the reservation is rolled back to an idle vacancy so the
    /// slot is not stranded busy.
    async fn connect_into(&self, index: usize) -> EngineResult<(ConnHandle, Box<dyn MailStore>)> {
        match self.connect_with_retry().await {
            Ok(store) => {
                let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let mut slots = self.lock_slots();
                slots[index].conn_id = conn_id;
                drop(slots);
                tracing::debug!(slot = index, conn_id, "pool grew by one connection");
                Ok((ConnHandle { index }, store))
            }
            Err(e) => {
                self.abandon(ConnHandle { index });
                Err(e)
            }
        }
    }

    /// Connect with the login retried up to [`LOGIN_ATTEMPTS`] times
    ///
    /// Each failure is logged; the final failure propagates as a hard error.
    async fn connect_with_retry(&self) -> EngineResult<Box<dyn MailStore>> {
        let mut last_error = None;
        for attempt in 1..=LOGIN_ATTEMPTS {
            match self.connector.connect().await {
                Ok(store) => return Ok(store),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "mail store login failed");
                    last_error = Some(e);
                }
            }
        }
        tracing::error!("giving up after {LOGIN_ATTEMPTS} login attempts");
        Err(last_error
            .unwrap_or_else(|| EngineError::Internal("login retry loop ran zero times".to_owned())))
    }

    /// Log out and drop every idle session
    ///
    /// Best-effort drain for process shutdown. Sessions currently checked
    /// out are untouched; their slots become vacancies once released and
    /// reconnect on the next acquire.
    pub async fn shutdown(&self) {
        let stores: Vec<Box<dyn MailStore>> = {
            let mut slots = self.lock_slots();
            slots
                .iter_mut()
                .filter(|slot| !slot.busy)
                .filter_map(|slot| slot.store.take())
                .collect()
        };
        for mut store in stores {
            if let Err(e) = store.logout().await {
                tracing::debug!(error = %e, "logout during pool shutdown failed");
            }
        }
    }

    /// Rebuild an idle slot's session in place, swallowing every error
    async fn reestablish(&self, index: usize) {
        match self.connect_with_retry().await {
            Ok(store) => {
                let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let mut slots = self.lock_slots();
                slots[index].store = Some(store);
                slots[index].conn_id = conn_id;
                slots[index].busy = false;
                drop(slots);
                tracing::info!(slot = index, conn_id, "replaced idle connection");
            }
            Err(e) => {
                tracing::warn!(slot = index, error = %e, "could not replace idle connection");
                let mut slots = self.lock_slots();
                slots[index].store = None;
                slots[index].busy = false;
            }
        }
    }

    /// Turn a reserved slot back into an idle vacancy
    fn abandon(&self, handle: ConnHandle) {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(handle.index) {
            slot.store = None;
            slot.busy = false;
        }
        drop(slots);
        self.released.notify_one();
    }

    /// Slot writes are single assignments, so a poisoned guard is still
    /// consistent; recover it rather than propagating the panic.
    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ConnHandle, ConnectionPool};
    use crate::config::ExhaustionPolicy;
    use crate::errors::EngineError;
    use crate::store::mock::{MockConnector, MockServer};

    fn pool_for(server: &Arc<MockServer>) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(MockConnector::new(Arc::clone(server))),
            None,
            ExhaustionPolicy::Wait,
        )
    }

    #[tokio::test]
    async fn concurrent_acquires_create_at_most_one_connection_each() {
        let server = MockServer::new();
        let pool = Arc::new(pool_for(&server));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let (handle, mut store) = pool.get_healthy().await.expect("acquire");
                store.noop().await.expect("exclusive session works");
                pool.release(handle, store).expect("release");
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        assert!(server.connection_count() <= 8);
        let created = server.connection_count();

        // every slot is idle now; another acquire must reuse, not create
        let (handle, store) = pool.acquire().await.expect("acquire");
        assert_eq!(server.connection_count(), created);
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn release_then_acquire_returns_the_same_connection() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (first_handle, store) = pool.acquire().await.expect("acquire");
        let first_id = pool.lock_slots()[0].conn_id;
        pool.release(first_handle, store).expect("release");

        let (second_handle, store) = pool.acquire().await.expect("acquire");
        assert_eq!(first_handle, second_handle);
        assert_eq!(pool.lock_slots()[0].conn_id, first_id);
        assert_eq!(server.connection_count(), 1);
        pool.release(second_handle, store).expect("release");
    }

    #[tokio::test]
    async fn replace_changes_identity_and_preserves_busy_state() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        let old_id = pool.lock_slots()[0].conn_id;
        drop(store);

        let fresh = pool.replace(handle).await.expect("replace");
        {
            let slots = pool.lock_slots();
            assert!(slots[0].busy, "slot stays checked out through replace");
            assert_ne!(slots[0].conn_id, old_id, "identity must change");
        }
        pool.release(handle, fresh).expect("release");
    }

    #[tokio::test]
    async fn login_gives_up_after_ten_attempts() {
        let server = MockServer::new();
        server.set_fail_logins(usize::MAX);
        let pool = pool_for(&server);

        let err = match pool.acquire().await {
            Ok(_) => panic!("must fail"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::AuthFailed(_)));
        assert_eq!(server.login_attempts(), 10);
        assert_eq!(server.connection_count(), 0);

        // the reserved slot must not be stranded busy
        server.set_fail_logins(0);
        let (handle, store) = pool.acquire().await.expect("acquire after recovery");
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn login_retries_through_transient_failures() {
        let server = MockServer::new();
        server.set_fail_logins(3);
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        assert_eq!(server.login_attempts(), 4);
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn release_of_unknown_handle_is_a_protocol_error() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        let err = pool
            .release(ConnHandle { index: 99 }, store)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Protocol(_)));

        // the real slot is still checked out and can be replaced normally
        let fresh = pool.replace(handle).await.expect("replace");
        pool.release(handle, fresh).expect("release");
    }

    #[tokio::test]
    async fn double_release_is_a_protocol_error() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        pool.release(handle, store).expect("first release");

        let connector = MockConnector::new(Arc::clone(&server));
        let stray = crate::store::Connector::connect(&connector)
            .await
            .expect("stray session");
        let err = pool.release(handle, stray).expect_err("must fail");
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn get_healthy_replaces_a_dead_connection_transparently() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        pool.release(handle, store).expect("release");
        server.kill_connection(0);

        let (handle, mut store) = pool.get_healthy().await.expect("get_healthy");
        store.noop().await.expect("replacement is alive");
        assert_eq!(server.connection_count(), 2);
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn sweep_idle_replaces_dead_sessions_and_never_errors() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        // two idle sessions
        let (h1, s1) = pool.acquire().await.expect("acquire");
        let (h2, s2) = pool.acquire().await.expect("acquire");
        pool.release(h1, s1).expect("release");
        pool.release(h2, s2).expect("release");
        assert_eq!(server.connection_count(), 2);

        server.kill_connection(0);
        pool.sweep_idle().await;

        // the dead one was replaced in place; both probe alive afterwards
        assert_eq!(server.connection_count(), 3);
        let (h1, mut s1) = pool.get_healthy().await.expect("get_healthy");
        let (h2, mut s2) = pool.get_healthy().await.expect("get_healthy");
        s1.noop().await.expect("alive");
        s2.noop().await.expect("alive");
        assert_eq!(server.connection_count(), 3, "no reconnect burst after sweep");
        pool.release(h1, s1).expect("release");
        pool.release(h2, s2).expect("release");
    }

    #[tokio::test]
    async fn fail_fast_policy_errors_at_capacity() {
        let server = MockServer::new();
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(Arc::clone(&server))),
            Some(1),
            ExhaustionPolicy::FailFast,
        );

        let (handle, store) = pool.acquire().await.expect("acquire");
        let err = match pool.acquire().await {
            Ok(_) => panic!("must fail"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::PoolExhausted));
        pool.release(handle, store).expect("release");

        let (handle, store) = pool.acquire().await.expect("acquire after release");
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn wait_policy_blocks_until_a_release() {
        let server = MockServer::new();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(MockConnector::new(Arc::clone(&server))),
            Some(1),
            ExhaustionPolicy::Wait,
        ));

        let (handle, store) = pool.acquire().await.expect("acquire");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let (handle, store) = pool.acquire().await.expect("acquire");
                pool.release(handle, store).expect("release");
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        pool.release(handle, store).expect("release");
        waiter.await.expect("waiter finished");
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_logs_out_idle_sessions() {
        let server = MockServer::new();
        let pool = pool_for(&server);

        let (handle, store) = pool.acquire().await.expect("acquire");
        pool.release(handle, store).expect("release");
        pool.shutdown().await;

        // the drained slot reconnects on the next acquire
        let (handle, mut store) = pool.acquire().await.expect("acquire");
        store.noop().await.expect("fresh session is alive");
        assert_eq!(server.connection_count(), 2);
        pool.release(handle, store).expect("release");
    }

    #[tokio::test]
    async fn acquire_release_storm_keeps_sessions_exclusive() {
        let server = MockServer::new();
        let pool = Arc::new(pool_for(&server));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let (handle, mut store) = pool.get_healthy().await.expect("get_healthy");
                    store.noop().await.expect("validated session stays alive");
                    pool.release(handle, store).expect("release");
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        assert!(server.connection_count() <= 16);
        assert_eq!(pool.size(), server.connection_count());
    }
}
