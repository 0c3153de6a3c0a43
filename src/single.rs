//! A transport over exactly one connection, for direct single-server use.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::{
    conn::{Command, Connection, ConnectionOptions, RawCommandResponse},
    error::{Error, Result},
    handshake::run_hello,
    options::{ClientOptions, ServerAddress},
    retry::RetryExecutor,
};

const TRANSPORT_TRACING_EVENT_TARGET: &str = "docwire::topology";

/// How many wait-queue timeouts a caller will wait for the connection to become free.
const BUSY_WAIT_MULTIPLIER: u32 = 5;

/// A transport with exactly one active connection and serialized access: at most one logical
/// operation uses the connection at a time, and further callers wait (bounded) until it is
/// free.
///
/// A background health check periodically runs the handshake on the idle connection; if the
/// server's answer contradicts the expected role (a writable server was wanted but the answer
/// says secondary), the connection is torn down and re-established, cycling the seed list the
/// same way the initial connect does. Operations that fail with a transport error close and
/// re-dial the connection before the error is surfaced, so the next caller starts from a fresh
/// socket.
///
/// Cloning is cheap and shares the underlying transport.
#[derive(Clone, Debug)]
pub struct SingleHostTransport {
    inner: Arc<SingleInner>,
}

#[derive(Debug)]
struct SingleInner {
    options: ClientOptions,
    retry: RetryExecutor,
    /// The one connection, when it exists and is idle.
    slot: Mutex<Option<Connection>>,
    /// Serializes use of the connection.
    semaphore: Arc<Semaphore>,
    /// The permit of the current borrower; dropped (released) at check-in.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    /// The address the live connection was dialed to, for reporting.
    current_address: Mutex<Option<ServerAddress>>,
    next_conn_id: AtomicU32,
    closed: AtomicBool,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl SingleHostTransport {
    /// Connects to the first reachable seed host, each given the configured retry budget.
    pub async fn connect(options: ClientOptions) -> Result<SingleHostTransport> {
        options.validate()?;

        let retry = RetryExecutor::new(options.retries_on_network_error, options.retry_backoff);
        let transport = SingleHostTransport {
            inner: Arc::new(SingleInner {
                retry,
                slot: Mutex::new(None),
                semaphore: Arc::new(Semaphore::new(1)),
                permit: Mutex::new(None),
                current_address: Mutex::new(None),
                next_conn_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                health: Mutex::new(None),
                options,
            }),
        };

        let conn = transport.dial_any_seed().await?;
        transport.store_connection(conn);
        *transport.inner.health.lock().unwrap() = Some(transport.start_health_check());

        Ok(transport)
    }

    /// Dials the seed hosts in order until one yields a connection with the expected role.
    async fn dial_any_seed(&self) -> Result<Connection> {
        let mut last_error = None;

        for address in &self.inner.options.hosts {
            let dial = self
                .inner
                .retry
                .run(|| self.dial_host(address))
                .await;
            match dial {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    tracing::warn!(
                        target: TRANSPORT_TRACING_EVENT_TARGET,
                        address = %address,
                        error = %err,
                        "seed host unusable"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::topology("no seed host could be reached")))
    }

    async fn dial_host(&self, address: &ServerAddress) -> Result<Connection> {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::connect(
            id,
            0,
            address.clone(),
            ConnectionOptions::from(&self.inner.options),
        )
        .await?;

        if let Err(err) = self.check_role(&conn) {
            conn.close().await;
            return Err(err);
        }
        Ok(conn)
    }

    /// Verifies that the server's handshake answer matches the role this transport expects: a
    /// writable server unless the configured read preference tolerates secondaries.
    fn check_role(&self, conn: &Connection) -> Result<()> {
        if !self.inner.options.read_preference.requires_primary() {
            return Ok(());
        }
        match conn.server_type() {
            Some(server_type) if server_type.is_writable() => Ok(()),
            _ => Err(Error::topology(format!(
                "{} is not writable but a primary was expected",
                conn.address()
            ))),
        }
    }

    fn store_connection(&self, conn: Connection) {
        *self.inner.current_address.lock().unwrap() = Some(conn.address().clone());
        *self.inner.slot.lock().unwrap() = Some(conn);
    }

    /// Borrows the connection, waiting (bounded by five wait-queue timeouts) for the current
    /// operation to finish. Re-dials first if the connection is gone.
    pub async fn check_out(&self) -> Result<Connection> {
        self.fail_if_closed()?;

        let wait = self.inner.options.wait_queue_timeout * BUSY_WAIT_MULTIPLIER;
        let permit = tokio::time::timeout(
            wait,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::timed_out(format!(
                "the connection stayed busy for {:?}",
                wait
            ))
        })?
        .map_err(|_| Error::topology("the transport is closed"))?;

        let existing = self
            .inner
            .slot
            .lock()
            .unwrap()
            .take()
            .filter(|conn| !conn.is_closed());

        let conn = match existing {
            Some(conn) => conn,
            None => match self.dial_any_seed().await {
                Ok(conn) => {
                    *self.inner.current_address.lock().unwrap() = Some(conn.address().clone());
                    conn
                }
                Err(err) => {
                    drop(permit);
                    return Err(err);
                }
            },
        };

        *self.inner.permit.lock().unwrap() = Some(permit);
        Ok(conn)
    }

    /// Returns the connection and frees the transport for the next caller. A connection whose
    /// socket died is discarded; the next checkout re-dials.
    pub fn check_in(&self, conn: Connection) {
        if conn.is_closed() {
            *self.inner.slot.lock().unwrap() = None;
        } else {
            *self.inner.slot.lock().unwrap() = Some(conn);
        }
        // Dropping the permit releases the semaphore.
        self.inner.permit.lock().unwrap().take();
    }

    /// Runs one command over the transport. A transport failure closes and re-dials the
    /// connection before the error is surfaced, so the caller's retry (if any) starts clean.
    pub async fn run_command(&self, command: Command) -> Result<RawCommandResponse> {
        let conn = self.check_out().await?;
        let result = conn.run_command(command).await;

        match result {
            Err(err) if err.is_transport() => {
                conn.close().await;
                self.check_in(conn);
                if let Err(redial) = self.reconnect().await {
                    tracing::debug!(
                        target: TRANSPORT_TRACING_EVENT_TARGET,
                        error = %redial,
                        "reconnect after transport failure did not succeed"
                    );
                }
                Err(err)
            }
            other => {
                self.check_in(conn);
                other
            }
        }
    }

    /// Re-establishes the connection if the slot is empty, without disturbing a healthy one.
    async fn reconnect(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.slot.lock().unwrap().is_some() {
            return Ok(());
        }
        let conn = self.dial_any_seed().await?;
        self.store_connection(conn);
        Ok(())
    }

    /// The address currently connected to.
    pub fn address(&self) -> Option<ServerAddress> {
        self.inner.current_address.lock().unwrap().clone()
    }

    /// Shuts the transport down: stops the health check and closes the connection. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(health) = self.inner.health.lock().unwrap().take() {
            health.abort();
        }
        self.inner.semaphore.close();
        let conn = self.inner.slot.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    fn fail_if_closed(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::topology("the transport is closed"))
        } else {
            Ok(())
        }
    }

    fn start_health_check(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.heartbeat_frequency;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let transport = SingleHostTransport { inner };
                if transport.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                transport.health_check().await;
            }
        })
    }

    /// One health-check pass: handshake the idle connection and tear it down on a role
    /// mismatch or failure. Skipped entirely while an operation holds the connection.
    async fn health_check(&self) {
        let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
            return;
        };

        let conn = self.inner.slot.lock().unwrap().take();
        let mut teardown = None;

        match conn {
            Some(conn) if !conn.is_closed() => match run_hello(&conn).await {
                Ok((reply, _)) => {
                    let role_ok = !self.inner.options.read_preference.requires_primary()
                        || reply.server_type().is_writable();
                    if role_ok {
                        *self.inner.slot.lock().unwrap() = Some(conn);
                    } else {
                        let err = Error::topology(format!(
                            "{} is no longer writable but a primary is expected",
                            conn.address()
                        ));
                        teardown = Some((conn, err));
                    }
                }
                Err(err) => teardown = Some((conn, err)),
            },
            _ => {
                if let Err(err) = self.reconnect().await {
                    tracing::warn!(
                        target: TRANSPORT_TRACING_EVENT_TARGET,
                        error = %err,
                        "health check could not re-establish the connection"
                    );
                }
            }
        }

        if let Some((conn, err)) = teardown {
            tracing::warn!(
                target: TRANSPORT_TRACING_EVENT_TARGET,
                address = %conn.address(),
                error = %err,
                "tearing down connection after failed health check"
            );
            conn.close().await;
            if let Err(redial) = self.reconnect().await {
                tracing::warn!(
                    target: TRANSPORT_TRACING_EVENT_TARGET,
                    error = %redial,
                    "reconnect after teardown did not succeed"
                );
            }
        }

        drop(permit);
    }
}
