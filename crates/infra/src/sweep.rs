//! Background release of reservations older than the TTL.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use larder_core::{OrderId, UserId};
use larder_inventory::{BomCatalog, HoldKey, Movement, MovementType, Reference};

use crate::coordinator::{HoldOutcome, ReservationCoordinator};
use crate::store::{InventoryStore, MovementLedger, StoreError, TimeRange};

/// Default span before the TTL cutoff searched for holds.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Actor recorded on movements written by the sweep.
pub fn system_actor() -> UserId {
    UserId::from_uuid(Uuid::nil())
}

/// Counters of one pass, or cumulative for a running sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub passes: u64,
    pub orders_examined: u64,
    pub holds_released: u64,
    pub failures: u64,
    pub uptime_secs: u64,
}

impl SweepStats {
    fn absorb(&mut self, pass: &SweepStats) {
        self.passes += pass.passes;
        self.orders_examined += pass.orders_examined;
        self.holds_released += pass.holds_released;
        self.failures += pass.failures;
    }
}

/// Handle to a running sweep thread.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
}

impl SweepHandle {
    /// Stop after the current pass and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SweepStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Releases holds whose RESERVE movement is older than `ttl`.
///
/// Each pass reads only the movements since `cutoff - lookback`, and examines
/// only orders with a hold in that window that no COMMIT_OUT or RELEASE has
/// settled. A hold committed or released concurrently is left alone (the
/// coordinator's guard keys settle the race), so running several sweeps is
/// harmless.
pub struct ExpirySweep<S, C> {
    coordinator: Arc<ReservationCoordinator<S, C>>,
    ttl: chrono::Duration,
    lookback: chrono::Duration,
    actor: UserId,
}

impl<S, C> ExpirySweep<S, C>
where
    S: InventoryStore + MovementLedger + 'static,
    C: BomCatalog + 'static,
{
    pub fn new(coordinator: Arc<ReservationCoordinator<S, C>>, ttl: Duration) -> Self {
        Self {
            coordinator,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            lookback: chrono::Duration::from_std(DEFAULT_LOOKBACK).unwrap_or(chrono::Duration::MAX),
            actor: system_actor(),
        }
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::MAX);
        self
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = actor;
        self
    }

    pub fn run_once(&self) -> Result<SweepStats, StoreError> {
        self.run_once_at(Utc::now())
    }

    /// One pass over every tenant as of `now`.
    ///
    /// A failing order is logged and counted; the pass goes on with the next.
    pub fn run_once_at(&self, now: DateTime<Utc>) -> Result<SweepStats, StoreError> {
        let cutoff = now.checked_sub_signed(self.ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let from = cutoff
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let store = self.coordinator.store();
        let mut stats = SweepStats {
            passes: 1,
            ..SweepStats::default()
        };

        for tenant_id in store.tenants()? {
            let window = store.list_by_tenant(tenant_id, TimeRange::since(from))?;
            for order_id in orders_with_open_holds(&window, cutoff) {
                stats.orders_examined += 1;
                match self
                    .coordinator
                    .release_expired(tenant_id, order_id, cutoff, self.actor)
                {
                    Ok(settlement) => {
                        let released = settlement
                            .lines
                            .iter()
                            .filter(|l| l.outcome == HoldOutcome::Released)
                            .count();
                        stats.holds_released += released as u64;
                    }
                    Err(e) => {
                        stats.failures += 1;
                        warn!(
                            tenant_id = %tenant_id,
                            order_id = %order_id,
                            error = %e,
                            "failed to release expired holds"
                        );
                    }
                }
            }
        }

        if stats.holds_released > 0 || stats.failures > 0 {
            info!(
                cutoff = %cutoff,
                orders = stats.orders_examined,
                released = stats.holds_released,
                failures = stats.failures,
                "expiry sweep pass"
            );
        } else {
            debug!(cutoff = %cutoff, orders = stats.orders_examined, "expiry sweep pass");
        }
        Ok(stats)
    }

    /// Run a pass every `interval` on a dedicated thread until shut down.
    pub fn spawn(self, interval: Duration) -> io::Result<SweepHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("expiry-sweep".to_string())
            .spawn(move || sweep_loop(self, interval, shutdown_rx, stats_clone))?;

        Ok(SweepHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

/// Orders holding a RESERVE older than `cutoff` that nothing in `movements`
/// has committed or released.
fn orders_with_open_holds(movements: &[Movement], cutoff: DateTime<Utc>) -> BTreeSet<OrderId> {
    let mut reserved = BTreeSet::new();
    let mut settled = HashSet::new();
    for m in movements {
        let Reference::Order {
            order_id,
            line,
            attempt,
        } = m.reference
        else {
            continue;
        };
        let key = HoldKey {
            order_id,
            line,
            attempt,
        };
        match m.kind {
            MovementType::Reserve if m.created_at < cutoff => {
                reserved.insert(key);
            }
            MovementType::CommitOut | MovementType::Release => {
                settled.insert(key);
            }
            _ => {}
        }
    }
    reserved
        .into_iter()
        .filter(|key| !settled.contains(key))
        .map(|key| key.order_id)
        .collect()
}

fn sweep_loop<S, C>(
    sweep: ExpirySweep<S, C>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweepStats>>,
) where
    S: InventoryStore + MovementLedger + 'static,
    C: BomCatalog + 'static,
{
    info!(interval_secs = interval.as_secs(), ttl_secs = sweep.ttl.num_seconds(), "expiry sweep started");
    let start_time = Instant::now();

    loop {
        match sweep.run_once() {
            Ok(pass) => {
                let mut s = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                s.absorb(&pass);
                s.uptime_secs = start_time.elapsed().as_secs();
            }
            Err(e) => error!(error = %e, "expiry sweep pass failed"),
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("expiry sweep stopped");
}
