//! Bounded per-host pool of authenticated remote-shell connections.
//!
//! Dialing and authenticating a remote shell is expensive, so connections are
//! reused. The pool enforces a hard cap on concurrently open connections per
//! host; checkout is the only blocking operation and its wait is bounded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::FleetError;
use crate::transport::{ShellConnection, ShellEndpoint, ShellTransport};

/// Sizing knobs for one host's pool.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub checkout_timeout: Duration,
}

/// Open/idle connection counters, for the admin host snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub open: usize,
    pub idle: usize,
}

struct PoolState {
    idle: VecDeque<Box<dyn ShellConnection>>,
    open: usize,
}

/// Connection pool for a single host.
///
/// Invariant: `open` never exceeds `max_connections`; it is incremented only
/// under the state lock behind the capacity check, and decremented on every
/// confirmed discard.
pub struct ConnectionPool {
    endpoint: ShellEndpoint,
    limits: PoolLimits,
    transport: Arc<dyn ShellTransport>,
    state: Mutex<PoolState>,
    idle_available: Notify,
}

impl ConnectionPool {
    pub fn new(
        endpoint: ShellEndpoint,
        limits: PoolLimits,
        transport: Arc<dyn ShellTransport>,
    ) -> Self {
        Self {
            endpoint,
            limits,
            transport,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
            }),
            idle_available: Notify::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.endpoint.hostname
    }

    pub fn counts(&self) -> PoolCounts {
        let state = lock_unpoisoned(&self.state);
        PoolCounts {
            open: state.open,
            idle: state.idle.len(),
        }
    }

    /// Checks out a live connection: idle reuse first, then a fresh dial under
    /// the capacity cap, then a bounded wait for a checkin. Fails with
    /// `PoolExhausted` when the wait times out.
    pub async fn checkout(&self) -> Result<Box<dyn ShellConnection>, FleetError> {
        if let Some(conn) = self.pop_idle() {
            if conn.is_alive().await {
                return Ok(conn);
            }
            self.retire(conn).await;
        }

        if self.try_reserve_slot() {
            return self.dial_held_slot().await;
        }

        let deadline = Instant::now() + self.limits.checkout_timeout;
        loop {
            // Created before the re-check below: a notify_waiters fired
            // after this line reaches the future even while it is unpolled.
            let notified = self.idle_available.notified();
            if let Some(conn) = self.pop_idle() {
                if conn.is_alive().await {
                    return Ok(conn);
                }
                // Dead connection pulled while at capacity: replace it in
                // place, preserving its open-slot accounting.
                conn.close().await;
                return self.dial_held_slot().await;
            }
            if self.try_reserve_slot() {
                return self.dial_held_slot().await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                return Err(FleetError::PoolExhausted {
                    host: self.endpoint.hostname.clone(),
                });
            }
        }
    }

    /// Returns a connection to the pool; a dead one is closed and its slot
    /// released immediately, recreating headroom for waiters.
    pub async fn checkin(&self, conn: Box<dyn ShellConnection>) {
        if conn.is_alive().await {
            {
                let mut state = lock_unpoisoned(&self.state);
                state.idle.push_back(conn);
            }
            // Wakes every waiter to re-check: notify_one permits do not
            // stack, so back-to-back checkins could coalesce into a single
            // wakeup and strand a waiter next to an idle connection.
            self.idle_available.notify_waiters();
            return;
        }
        debug!("discarding dead connection to {}", self.endpoint.hostname);
        self.retire(conn).await;
    }

    /// Drains and closes every idle connection. Connections currently checked
    /// out are unaffected and release their slots on checkin.
    pub async fn close_all(&self) {
        let drained: Vec<Box<dyn ShellConnection>> = {
            let mut state = lock_unpoisoned(&self.state);
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open = state.open.saturating_sub(drained.len());
            drained
        };
        for conn in drained {
            conn.close().await;
        }
    }

    fn pop_idle(&self) -> Option<Box<dyn ShellConnection>> {
        lock_unpoisoned(&self.state).idle.pop_front()
    }

    fn try_reserve_slot(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if state.open < self.limits.max_connections {
            state.open += 1;
            true
        } else {
            false
        }
    }

    async fn retire(&self, conn: Box<dyn ShellConnection>) {
        conn.close().await;
        {
            let mut state = lock_unpoisoned(&self.state);
            state.open = state.open.saturating_sub(1);
        }
        // Freed capacity: blocked checkouts re-check and one dials a
        // replacement.
        self.idle_available.notify_waiters();
    }

    /// Dials with an open slot already reserved; the slot is released when the
    /// dial fails.
    async fn dial_held_slot(&self) -> Result<Box<dyn ShellConnection>, FleetError> {
        match self.transport.connect(&self.endpoint).await {
            Ok(conn) => Ok(conn),
            Err(error) => {
                {
                    let mut state = lock_unpoisoned(&self.state);
                    state.open = state.open.saturating_sub(1);
                }
                self.idle_available.notify_waiters();
                Err(error)
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
