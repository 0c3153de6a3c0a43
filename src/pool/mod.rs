mod host;
mod monitor;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use rand::Rng;
use tokio::task::JoinHandle;

pub(crate) use host::HostState;

use crate::{
    conn::{Connection, ConnectionOptions},
    error::{Error, Result},
    handshake::HelloReply,
    options::{ClientOptions, ServerAddress},
    read_preference::ReadPreference,
    retry::RetryExecutor,
    session::Session,
};

const TOPOLOGY_TRACING_EVENT_TARGET: &str = "docwire::topology";

/// The lifecycle state of a driver transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverStatus {
    /// Not connected; the terminal state after `close`.
    Disconnected,
    /// The initial seed dial is in progress.
    Connecting,
    /// Serving checkouts; the health monitor runs continuously in this state.
    Connected,
}

/// A connection pool over a replica set (or a single server), presenting one logical transport
/// that hides topology changes behind read-preference-aware checkout.
///
/// Cloning is cheap and shares the underlying pool.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    options: ClientOptions,
    retry: RetryExecutor,
    state: Mutex<PoolState>,
    status: Mutex<DriverStatus>,
    /// Wakes checkout waiters whenever a connection is returned or a slot frees up.
    connection_available: tokio::sync::Notify,
    next_conn_id: AtomicU32,
    /// Bumped when replica-set membership shrinks; borrowed connections from an older
    /// generation are discarded instead of requeued when they come back.
    generation: AtomicU32,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    hosts: HashMap<ServerAddress, HostState>,
    /// The live host list in selection order; seeds that never connect are pruned, members
    /// announced by the primary are appended.
    seeds: Vec<ServerAddress>,
    primary: Option<ServerAddress>,
    next_secondary: usize,
}

impl ConnectionPool {
    /// Connects to the deployment described by `options`.
    ///
    /// Each seed host is dialed up to the configured minimum pool size, tolerating individual
    /// failures: a seed that cannot be reached within the retry budget is pruned from the live
    /// host list. Connecting fails only if no seed is reachable at all. The handshake replies
    /// determine the primary and the announced replica-set membership, after which the health
    /// monitor starts.
    pub async fn connect(options: ClientOptions) -> Result<ConnectionPool> {
        options.validate()?;

        let retry = RetryExecutor::new(options.retries_on_network_error, options.retry_backoff);
        let mut seeds = Vec::new();
        for host in &options.hosts {
            if !seeds.contains(host) {
                seeds.push(host.clone());
            }
        }

        // Start the secondary round-robin at a random offset so a fleet of freshly started
        // clients doesn't gang up on the same member.
        let round_robin_offset = rand::rng().random_range(0..1024);

        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                retry,
                state: Mutex::new(PoolState {
                    hosts: seeds
                        .iter()
                        .map(|address| (address.clone(), HostState::new()))
                        .collect(),
                    seeds,
                    primary: None,
                    next_secondary: round_robin_offset,
                }),
                status: Mutex::new(DriverStatus::Connecting),
                connection_available: tokio::sync::Notify::new(),
                next_conn_id: AtomicU32::new(1),
                generation: AtomicU32::new(0),
                monitor: Mutex::new(None),
                options,
            }),
        };

        pool.dial_seeds().await?;
        *pool.inner.status.lock().unwrap() = DriverStatus::Connected;
        *pool.inner.monitor.lock().unwrap() = Some(monitor::start(&pool));

        Ok(pool)
    }

    async fn dial_seeds(&self) -> Result<()> {
        let seeds: Vec<ServerAddress> = self.inner.state.lock().unwrap().seeds.clone();
        let min_connections = std::cmp::max(1, self.inner.options.min_pool_size);

        for address in &seeds {
            let mut dialed = 0;
            for _ in 0..min_connections {
                if !self.try_reserve_slot(address)? {
                    break;
                }
                let dial = self
                    .inner
                    .retry
                    .run(|| self.dial_and_register(address))
                    .await;
                match dial {
                    Ok(conn) => {
                        dialed += 1;
                        self.check_in(conn);
                    }
                    Err(err) => {
                        self.release_slot(address, true);
                        tracing::warn!(
                            target: TOPOLOGY_TRACING_EVENT_TARGET,
                            address = %address,
                            error = %err,
                            "seed host unreachable"
                        );
                        break;
                    }
                }
            }

            if dialed == 0 {
                let mut state = self.inner.state.lock().unwrap();
                state.seeds.retain(|seed| seed != address);
                state.hosts.remove(address);
            }
        }

        let state = self.inner.state.lock().unwrap();
        if state.seeds.is_empty() {
            drop(state);
            *self.inner.status.lock().unwrap() = DriverStatus::Disconnected;
            return Err(Error::topology("no seed host could be reached"));
        }
        Ok(())
    }

    /// Reserves a borrow slot for `address` under the state lock, so the capacity check and
    /// the reservation are one atomic step. `Ok(false)` means the host is at its cap.
    fn try_reserve_slot(&self, address: &ServerAddress) -> Result<bool> {
        let mut state = self.inner.state.lock().unwrap();
        let host = state
            .hosts
            .get_mut(address)
            .ok_or_else(|| Error::topology(format!("{} is not a known host", address)))?;
        if host.total_connections() >= self.inner.options.max_pool_size {
            return Ok(false);
        }
        host.checked_out += 1;
        Ok(true)
    }

    fn release_slot(&self, address: &ServerAddress, failed: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(host) = state.hosts.get_mut(address) {
            host.checked_out = host.checked_out.saturating_sub(1);
            if failed {
                host.consecutive_failures += 1;
            }
        }
        drop(state);
        self.inner.connection_available.notify_waiters();
    }

    /// Dials one connection to an `address` whose borrow slot the caller has already reserved
    /// via [`try_reserve_slot`](Self::try_reserve_slot), and folds what the handshake revealed
    /// (round-trip time, primary identity, replica-set membership) into the pool state. This is
    /// the single dial path shared by connect, checkout, and the monitor's top-up. The caller
    /// releases the reservation on failure; on success the returned connection stays counted
    /// as checked out — hand it to a borrower or [`check_in`](Self::check_in) it.
    pub(crate) async fn dial_and_register(&self, address: &ServerAddress) -> Result<Connection> {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let conn = Connection::connect(
            id,
            generation,
            address.clone(),
            ConnectionOptions::from(&self.inner.options),
        )
        .await?;

        let description = conn
            .description
            .clone()
            .ok_or_else(|| Error::invalid_response("connection established without a handshake"))?;

        let orphans = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(host) = state.hosts.get_mut(address) {
                host.consecutive_failures = 0;
                host.round_trip_time = Some(description.initial_round_trip);
            }

            if description.server_type.is_writable() {
                state.primary = Some(address.clone());
                self.reconcile_membership(&mut state, &description.hello)
            } else {
                if state.primary.is_none() {
                    state.primary = description.hello.primary_address();
                }
                Vec::new()
            }
        };
        self.close_all(orphans).await;

        Ok(conn)
    }

    /// Checks out a connection according to `read_preference`.
    ///
    /// Selection policy: a single-node deployment always uses its one node. `Primary` requires
    /// the known primary. `Nearest` prefers the host with the lowest measured round-trip time
    /// and cascades to the `PrimaryPreferred` path on failure; `PrimaryPreferred` uses the
    /// primary when it has an idle connection and otherwise cascades to secondary selection;
    /// `Secondary` and `SecondaryPreferred` round-robin across the non-primary members, with
    /// `SecondaryPreferred` falling back to the primary when no secondary can serve. Within
    /// the chosen host, an idle connection is reused before a new one is dialed, and dialing
    /// stops at the per-host maximum — further borrowers wait, bounded by the configured
    /// wait-queue timeout.
    pub async fn check_out(&self, read_preference: ReadPreference) -> Result<Connection> {
        self.fail_unless_connected()?;

        // Single-node deployments have exactly one sensible answer.
        let single = {
            let state = self.inner.state.lock().unwrap();
            match state.seeds.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            }
        };
        if let Some(address) = single {
            return self.check_out_host(&address).await;
        }

        match read_preference {
            ReadPreference::Primary => {
                let primary = self.primary_or_err()?;
                self.check_out_host(&primary).await
            }
            ReadPreference::Nearest => match self.check_out_nearest().await {
                Ok(conn) => Ok(conn),
                // Cascading preference: nearest falls through to primary-preferred.
                Err(_) => self.check_out_primary_preferred().await,
            },
            ReadPreference::PrimaryPreferred => self.check_out_primary_preferred().await,
            ReadPreference::Secondary => self.check_out_secondary(false).await,
            ReadPreference::SecondaryPreferred => self.check_out_secondary(true).await,
        }
    }

    /// Checks out a connection for an operation running under `session`. An active transaction
    /// forces `Primary` regardless of the requested preference.
    pub async fn check_out_in_session(
        &self,
        read_preference: ReadPreference,
        session: Option<&Session>,
    ) -> Result<Connection> {
        let effective = match session {
            Some(session) if session.in_transaction() => ReadPreference::Primary,
            _ => read_preference,
        };
        self.check_out(effective).await
    }

    async fn check_out_nearest(&self) -> Result<Connection> {
        let nearest = {
            let state = self.inner.state.lock().unwrap();
            state
                .seeds
                .iter()
                .min_by_key(|address| {
                    state
                        .hosts
                        .get(*address)
                        .and_then(|host| host.round_trip_time)
                        .unwrap_or(std::time::Duration::MAX)
                })
                .cloned()
        };
        match nearest {
            Some(address) => self.check_out_host(&address).await,
            None => Err(Error::topology("no host available")),
        }
    }

    async fn check_out_primary_preferred(&self) -> Result<Connection> {
        let primary_with_idle = {
            let state = self.inner.state.lock().unwrap();
            state.primary.clone().filter(|primary| {
                state
                    .hosts
                    .get(primary)
                    .map(|host| !host.idle.is_empty())
                    .unwrap_or(false)
            })
        };
        if let Some(primary) = primary_with_idle {
            if let Ok(conn) = self.check_out_host(&primary).await {
                return Ok(conn);
            }
        }
        self.check_out_secondary(true).await
    }

    async fn check_out_secondary(&self, fall_back_to_primary: bool) -> Result<Connection> {
        let mut last_error = None;

        for _ in 0..std::cmp::max(1, self.inner.options.retries_on_network_error) {
            let candidate = {
                let mut state = self.inner.state.lock().unwrap();
                let secondaries: Vec<ServerAddress> = state
                    .seeds
                    .iter()
                    .filter(|address| state.primary.as_ref() != Some(*address))
                    .cloned()
                    .collect();
                if secondaries.is_empty() {
                    None
                } else {
                    let index = state.next_secondary % secondaries.len();
                    state.next_secondary = state.next_secondary.wrapping_add(1);
                    Some(secondaries[index].clone())
                }
            };

            let Some(address) = candidate else { break };
            match self.check_out_host(&address).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    tracing::debug!(
                        target: TOPOLOGY_TRACING_EVENT_TARGET,
                        address = %address,
                        error = %err,
                        "secondary selection failed, trying another host"
                    );
                    last_error = Some(err);
                }
            }
        }

        if fall_back_to_primary {
            let primary = self.primary_or_err()?;
            return self.check_out_host(&primary).await;
        }

        Err(last_error.unwrap_or_else(|| Error::topology("no secondary available")))
    }

    /// Checks out a connection to one specific host: idle reuse first, then a new dial when
    /// under the per-host cap, otherwise a bounded wait for a return.
    async fn check_out_host(&self, address: &ServerAddress) -> Result<Connection> {
        let deadline = Instant::now() + self.inner.options.wait_queue_timeout;
        let generation = self.inner.generation.load(Ordering::SeqCst);

        enum Action {
            Reuse(Connection),
            Dial,
            Wait,
        }

        loop {
            self.fail_unless_connected()?;

            let mut notified = std::pin::pin!(self.inner.connection_available.notified());
            notified.as_mut().enable();

            let action = {
                let mut state = self.inner.state.lock().unwrap();
                let host = state
                    .hosts
                    .get_mut(address)
                    .ok_or_else(|| Error::topology(format!("{} is not a known host", address)))?;

                if let Some(conn) = host.pop_idle(generation) {
                    host.checked_out += 1;
                    Action::Reuse(conn)
                } else if host.total_connections() < self.inner.options.max_pool_size {
                    // Reserve the slot while still holding the lock so concurrent borrowers
                    // cannot over-dial past the cap.
                    host.checked_out += 1;
                    Action::Dial
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Reuse(mut conn) => {
                    conn.mark_checked_out();
                    return Ok(conn);
                }
                Action::Dial => {
                    return match self.dial_and_register(address).await {
                        Ok(conn) => Ok(conn),
                        Err(err) => {
                            self.release_slot(address, true);
                            Err(err)
                        }
                    }
                }
                Action::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::pool_exhausted(address.clone()));
                    }
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
            }
        }
    }

    /// Returns a borrowed connection to its host's idle queue. Closed or stale connections are
    /// discarded instead of requeued; either way the host's borrow slot frees up and one more
    /// waiter can proceed.
    pub fn check_in(&self, mut conn: Connection) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.hosts.get_mut(conn.address()) {
                Some(host) => {
                    host.checked_out = host.checked_out.saturating_sub(1);
                    if !conn.is_closed() && !conn.is_stale(generation) {
                        conn.mark_checked_in();
                        host.idle.push_back(conn);
                    }
                }
                // The host left the replica set while this connection was out.
                None => drop(conn),
            }
        }
        self.inner.connection_available.notify_waiters();
    }

    /// Alias for [`check_in`](Self::check_in), provided for symmetry with checkout.
    pub fn release_connection(&self, conn: Connection) {
        self.check_in(conn);
    }

    /// Closes `conn` and restores the pool bookkeeping for its host.
    pub async fn close_connection(&self, conn: Connection) {
        conn.close().await;
        self.check_in(conn);
    }

    /// Shuts the pool down: stops the monitor, closes every pooled connection, and fails any
    /// waiting checkouts. Idempotent.
    pub async fn close(&self) {
        *self.inner.status.lock().unwrap() = DriverStatus::Disconnected;

        if let Some(monitor) = self.inner.monitor.lock().unwrap().take() {
            monitor.abort();
        }

        let orphans = {
            let mut state = self.inner.state.lock().unwrap();
            let mut orphans = Vec::new();
            for host in state.hosts.values_mut() {
                orphans.extend(host.idle.drain(..));
            }
            orphans
        };
        self.close_all(orphans).await;
        self.inner.connection_available.notify_waiters();
    }

    /// The current lifecycle state.
    pub fn status(&self) -> DriverStatus {
        *self.inner.status.lock().unwrap()
    }

    /// The live host list: seeds that connected plus members announced by the primary, minus
    /// anything pruned or de-listed since.
    pub fn hosts(&self) -> Vec<ServerAddress> {
        self.inner.state.lock().unwrap().seeds.clone()
    }

    /// The current known primary.
    pub fn primary(&self) -> Option<ServerAddress> {
        self.inner.state.lock().unwrap().primary.clone()
    }

    /// The number of idle connections currently pooled for `address`.
    pub fn idle_connections(&self, address: &ServerAddress) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .hosts
            .get(address)
            .map(|host| host.idle.len())
            .unwrap_or(0)
    }

    fn fail_unless_connected(&self) -> Result<()> {
        match *self.inner.status.lock().unwrap() {
            DriverStatus::Disconnected => Err(Error::topology("the driver is not connected")),
            DriverStatus::Connecting | DriverStatus::Connected => Ok(()),
        }
    }

    fn primary_or_err(&self) -> Result<ServerAddress> {
        self.inner
            .state
            .lock()
            .unwrap()
            .primary
            .clone()
            .ok_or_else(|| Error::topology("no primary is known"))
    }

    /// Applies the membership a primary announced: adds newly listed hosts and removes
    /// de-listed ones, returning the removed hosts' pooled connections for the caller to close
    /// outside the state lock.
    pub(crate) fn reconcile_membership(
        &self,
        state: &mut PoolState,
        hello: &HelloReply,
    ) -> Vec<Connection> {
        let announced = hello.member_addresses();
        if announced.is_empty() {
            return Vec::new();
        }

        for address in &announced {
            if !state.hosts.contains_key(address) {
                tracing::info!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    address = %address,
                    "adding newly announced replica-set member"
                );
                state.hosts.insert(address.clone(), HostState::new());
                state.seeds.push(address.clone());
            }
        }

        let delisted: Vec<ServerAddress> = state
            .seeds
            .iter()
            .filter(|address| !announced.contains(*address))
            .cloned()
            .collect();

        let mut orphans = Vec::new();
        for address in delisted {
            tracing::warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                address = %address,
                "dropping host no longer in replica-set membership"
            );
            state.seeds.retain(|seed| seed != &address);
            if let Some(mut host) = state.hosts.remove(&address) {
                orphans.extend(host.idle.drain(..));
            }
            if state.primary.as_ref() == Some(&address) {
                state.primary = None;
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }

        orphans
    }

    pub(crate) async fn close_all(&self, conns: Vec<Connection>) {
        for conn in conns {
            conn.close().await;
        }
        if self.status() != DriverStatus::Disconnected {
            self.inner.connection_available.notify_waiters();
        }
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn retry(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    pub(crate) fn state(&self) -> &Mutex<PoolState> {
        &self.inner.state
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }
}

impl PoolState {
    pub(crate) fn addresses(&self) -> Vec<ServerAddress> {
        self.seeds.clone()
    }

    pub(crate) fn host_mut(&mut self, address: &ServerAddress) -> Option<&mut HostState> {
        self.hosts.get_mut(address)
    }

    pub(crate) fn set_primary(&mut self, address: Option<ServerAddress>) {
        self.primary = address;
    }

    pub(crate) fn remove_host(&mut self, address: &ServerAddress) -> Option<HostState> {
        self.seeds.retain(|seed| seed != address);
        if self.primary.as_ref() == Some(address) {
            self.primary = None;
        }
        self.hosts.remove(address)
    }
}
