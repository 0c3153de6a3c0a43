//! The periodic topology/health monitor.
//!
//! Every heartbeat period, for every known host: expire over-age connections, `hello`-ping the
//! survivors, fold primary/membership answers back into the pool, top idle pools back up to
//! their minimum, and prune hosts that stay unreachable. The monitor holds only a weak
//! reference to the pool, so it dies with it.

use tokio::task::JoinHandle;

use super::{ConnectionPool, DriverStatus};
use crate::{
    conn::Connection,
    handshake::run_hello,
    options::ServerAddress,
};

const MONITOR_TRACING_EVENT_TARGET: &str = "docwire::topology";

pub(super) fn start(pool: &ConnectionPool) -> JoinHandle<()> {
    let weak = pool.downgrade();
    let period = pool.options().heartbeat_frequency;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; checks start one period after connect.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let pool = ConnectionPool::from_inner(inner);
            if pool.status() != DriverStatus::Connected {
                break;
            }
            run_health_check(&pool).await;
        }
    })
}

pub(super) async fn run_health_check(pool: &ConnectionPool) {
    let addresses = pool.state().lock().unwrap().addresses();
    for address in addresses {
        check_host(pool, &address).await;
    }
}

async fn check_host(pool: &ConnectionPool, address: &ServerAddress) {
    let options = pool.options().clone();

    // Take the idle connections out for inspection. They count as borrowed while the monitor
    // holds them so concurrent checkouts keep honoring the per-host cap.
    let idle: Vec<Connection> = {
        let mut state = pool.state().lock().unwrap();
        let Some(host) = state.host_mut(address) else {
            return;
        };
        let conns: Vec<Connection> = host.idle.drain(..).collect();
        host.checked_out += conns.len() as u32;
        conns
    };

    for conn in idle {
        if conn.is_expired(options.max_connection_lifetime) || conn.is_idle(options.max_idle_time)
        {
            tracing::debug!(
                target: MONITOR_TRACING_EVENT_TARGET,
                address = %address,
                id = conn.id(),
                "closing connection past its lifetime or idle bound"
            );
            pool.close_connection(conn).await;
            continue;
        }

        match run_hello(&conn).await {
            Ok((reply, round_trip)) => {
                let orphans = {
                    let mut state = pool.state().lock().unwrap();
                    if let Some(host) = state.host_mut(address) {
                        host.round_trip_time = Some(round_trip);
                        host.consecutive_failures = 0;
                    }
                    if reply.server_type().is_writable() {
                        state.set_primary(Some(address.clone()));
                        pool.reconcile_membership(&mut state, &reply)
                    } else {
                        Vec::new()
                    }
                };
                pool.close_all(orphans).await;
                pool.check_in(conn);
            }
            Err(err) => {
                tracing::warn!(
                    target: MONITOR_TRACING_EVENT_TARGET,
                    address = %address,
                    id = conn.id(),
                    error = %err,
                    "health check failed, discarding connection"
                );
                {
                    let mut state = pool.state().lock().unwrap();
                    if let Some(host) = state.host_mut(address) {
                        host.consecutive_failures += 1;
                    }
                }
                pool.close_connection(conn).await;
            }
        }
    }

    top_up(pool, address).await;
    prune_if_unreachable(pool, address);
}

/// Re-dials until the host holds its configured minimum of pooled connections again.
async fn top_up(pool: &ConnectionPool, address: &ServerAddress) {
    let min_pool_size = pool.options().min_pool_size;

    loop {
        let wanted = {
            let mut state = pool.state().lock().unwrap();
            match state.host_mut(address) {
                Some(host) => host.total_connections() < min_pool_size,
                None => false,
            }
        };
        if !wanted {
            return;
        }

        match pool.try_reserve_slot(address) {
            Ok(true) => {}
            _ => return,
        }
        match pool.retry().run(|| pool.dial_and_register(address)).await {
            Ok(conn) => pool.check_in(conn),
            Err(err) => {
                pool.release_slot(address, true);
                tracing::warn!(
                    target: MONITOR_TRACING_EVENT_TARGET,
                    address = %address,
                    error = %err,
                    "failed to restore the host's minimum pool size"
                );
                return;
            }
        }
    }
}

/// Drops a host that has failed too many consecutive checks and holds no connections.
fn prune_if_unreachable(pool: &ConnectionPool, address: &ServerAddress) {
    let threshold = pool.options().host_failure_threshold;
    let mut state = pool.state().lock().unwrap();
    let Some(host) = state.host_mut(address) else {
        return;
    };

    if host.consecutive_failures >= threshold && host.total_connections() == 0 {
        tracing::warn!(
            target: MONITOR_TRACING_EVENT_TARGET,
            address = %address,
            failures = host.consecutive_failures,
            "pruning unreachable host"
        );
        state.remove_host(address);
    }
}
