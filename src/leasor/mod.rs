use crate::error::{PortalError, Result};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// A granted, time-bounded reservation of one port for one backend address.
///
/// Leases are immutable once handed out; renewal returns a fresh clone with
/// an extended timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub pattern: String,
    pub address: String,
    pub port: u16,
    pub timeout: SystemTime,
}

impl Lease {
    /// Stable key used for durable registration lookup.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.address, self.port, self.pattern)
    }
}

/// Why a lease was cancelled. Replacement evictions keep the port under a
/// new lease, so HTTP routes installed for the old lease stay reachable;
/// expiry and explicit unregistration tear everything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Expired,
    Unregistered,
    /// A fixed-port registration took the port over.
    Replaced,
}

/// Fired while the leasor lock is held whenever a lease is evicted, expired,
/// or unregistered. Callbacks must be cheap and must not re-enter the leasor.
pub type CancelCallback = Arc<dyn Fn(&Lease, CancelReason) + Send + Sync>;

struct LeasorInner {
    /// Shuffled unused ports within `[start, end]`. Popped from the back.
    free_pool: Vec<u16>,
    /// Live leases keyed by port. A port is in exactly one of the pool or
    /// this map (fixed ports outside the range live only here).
    leases: HashMap<u16, Lease>,
    callbacks: Vec<CancelCallback>,
}

/// Port allocator for a single backend address.
pub struct PortLeasor {
    address: String,
    start: u16,
    end: u16,
    ttl: Duration,
    reserved: Arc<Vec<u16>>,
    inner: Mutex<LeasorInner>,
}

impl PortLeasor {
    pub fn new(
        address: &str,
        start: u16,
        end: u16,
        ttl: Duration,
        reserved: Arc<Vec<u16>>,
    ) -> Self {
        let mut free_pool: Vec<u16> = (start..=end)
            .filter(|p| !reserved.contains(p))
            .collect();
        free_pool.shuffle(&mut rand::thread_rng());

        Self {
            address: address.to_string(),
            start,
            end,
            ttl,
            reserved,
            inner: Mutex::new(LeasorInner {
                free_pool,
                leases: HashMap::new(),
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Grant a lease for `pattern`.
    ///
    /// `fixed_port == 0` draws from the shuffled free pool, skipping any
    /// port already live (a collision can only come from leases restored
    /// from the state file). A non-zero fixed port evicts whatever lease
    /// currently holds it, firing the cancellation callbacks so routes and
    /// listeners for the old lease are torn down first.
    pub fn register(&self, pattern: &str, fixed_port: u32) -> Result<Lease> {
        if fixed_port >= 65536 {
            return Err(PortalError::InvalidPort(fixed_port));
        }

        let mut inner = self.inner.lock().expect("leasor lock poisoned");

        let port = if fixed_port == 0 {
            loop {
                let Some(candidate) = inner.free_pool.pop() else {
                    return Err(PortalError::NoPortsAvailable);
                };
                if !inner.leases.contains_key(&candidate) {
                    break candidate;
                }
                // Port was restored from state while also sitting in the
                // pool; dropping it here restores the pool/lease invariant.
            }
        } else {
            let port = fixed_port as u16;
            if self.reserved.contains(&port) {
                return Err(PortalError::FixedPortTaken(port));
            }
            if let Some(old) = inner.leases.remove(&port) {
                tracing::info!(
                    "leasor: evicting lease for replacement, address={}, port={}, pattern={}",
                    old.address,
                    old.port,
                    old.pattern
                );
                for cb in &inner.callbacks {
                    cb(&old, CancelReason::Replaced);
                }
                metrics::gauge!("portal_leases_active").decrement(1.0);
            }
            port
        };

        let lease = Lease {
            pattern: pattern.to_string(),
            address: self.address.clone(),
            port,
            timeout: SystemTime::now() + self.ttl,
        };
        inner.leases.insert(port, lease.clone());
        metrics::gauge!("portal_leases_active").increment(1.0);
        Ok(lease)
    }

    /// Extend the timeout of a live lease. Returns a fresh clone; callers
    /// never observe shared mutable state.
    pub fn renew(&self, lease: &Lease) -> Result<Lease> {
        let mut inner = self.inner.lock().expect("leasor lock poisoned");
        let current = inner
            .leases
            .get_mut(&lease.port)
            .ok_or(PortalError::Unregistered)?;
        if current.pattern != lease.pattern {
            return Err(PortalError::InvalidLease);
        }
        current.timeout = SystemTime::now() + self.ttl;
        Ok(current.clone())
    }

    /// Drop a lease, firing cancellation callbacks. The port returns to the
    /// free pool only when it lies inside `[start, end]`; fixed ports
    /// outside the range are not pooled.
    pub fn unregister(&self, lease: &Lease) -> Result<Lease> {
        let mut inner = self.inner.lock().expect("leasor lock poisoned");
        match inner.leases.get(&lease.port) {
            None => return Err(PortalError::Unregistered),
            Some(current) if current.pattern != lease.pattern => {
                return Err(PortalError::InvalidLease)
            }
            Some(_) => {}
        }
        let removed = inner
            .leases
            .remove(&lease.port)
            .expect("lease checked above");
        for cb in &inner.callbacks {
            cb(&removed, CancelReason::Unregistered);
        }
        if (self.start..=self.end).contains(&lease.port) && !self.reserved.contains(&lease.port) {
            // Front of the pool is drawn last, deferring port reuse.
            inner.free_pool.insert(0, lease.port);
        }
        metrics::gauge!("portal_leases_active").decrement(1.0);
        Ok(removed)
    }

    /// Append a cancellation callback.
    pub fn on_cancel(&self, cb: CancelCallback) {
        let mut inner = self.inner.lock().expect("leasor lock poisoned");
        inner.callbacks.push(cb);
    }

    /// Delete expired leases and fire their callbacks. Returns the number
    /// of leases removed. Leases inserted while the sweep holds the lock
    /// are seen by the next tick.
    pub fn sweep(&self) -> usize {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().expect("leasor lock poisoned");
        let expired: Vec<u16> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.timeout <= now)
            .map(|(port, _)| *port)
            .collect();

        for port in &expired {
            let lease = inner.leases.remove(port).expect("collected above");
            tracing::info!(
                "leasor: lease expired, address={}, port={}, pattern={}",
                lease.address,
                lease.port,
                lease.pattern
            );
            for cb in &inner.callbacks {
                cb(&lease, CancelReason::Expired);
            }
            if (self.start..=self.end).contains(port) && !self.reserved.contains(port) {
                inner.free_pool.insert(0, *port);
            }
            metrics::gauge!("portal_leases_active").decrement(1.0);
            metrics::counter!("portal_lease_expirations_total").increment(1);
        }
        expired.len()
    }

    /// Snapshot of all live leases.
    pub fn leases(&self) -> Vec<Lease> {
        let inner = self.inner.lock().expect("leasor lock poisoned");
        inner.leases.values().cloned().collect()
    }

    #[cfg(test)]
    fn free_pool_len(&self) -> usize {
        self.inner.lock().unwrap().free_pool.len()
    }
}

/// One `PortLeasor` per backend address. Different backends can lease the
/// same port number without conflict; all lease state is partitioned by the
/// address the RPC resolved for the client.
pub struct ClientLeasor {
    start: u16,
    end: u16,
    ttl: Duration,
    reserved: Arc<Vec<u16>>,
    leasors: DashMap<String, Arc<PortLeasor>>,
    /// Callbacks propagated to every child leasor, including ones created
    /// after the callback was added.
    callbacks: Mutex<Vec<CancelCallback>>,
}

impl ClientLeasor {
    pub fn new(start: u16, end: u16, ttl: Duration, reserved: Vec<u16>) -> Self {
        Self {
            start,
            end,
            ttl,
            reserved: Arc::new(reserved),
            leasors: DashMap::new(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Get or create the leasor owning `address`.
    pub fn leasor_for(&self, address: &str) -> Arc<PortLeasor> {
        if let Some(existing) = self.leasors.get(address) {
            return existing.value().clone();
        }
        let leasor = Arc::new(PortLeasor::new(
            address,
            self.start,
            self.end,
            self.ttl,
            self.reserved.clone(),
        ));
        {
            let callbacks = self.callbacks.lock().expect("callback lock poisoned");
            for cb in callbacks.iter() {
                leasor.on_cancel(cb.clone());
            }
        }
        self.leasors
            .entry(address.to_string())
            .or_insert(leasor)
            .value()
            .clone()
    }

    /// Look up the leasor for an address without creating one.
    pub fn get(&self, address: &str) -> Option<Arc<PortLeasor>> {
        self.leasors.get(address).map(|e| e.value().clone())
    }

    /// Register a cancellation callback on every current and future child.
    pub fn on_cancel(&self, cb: CancelCallback) {
        {
            let mut callbacks = self.callbacks.lock().expect("callback lock poisoned");
            callbacks.push(cb.clone());
        }
        for entry in self.leasors.iter() {
            entry.value().on_cancel(cb.clone());
        }
    }

    /// One sweep pass over every child leasor.
    pub fn sweep_all(&self) -> usize {
        let mut removed = 0;
        for entry in self.leasors.iter() {
            removed += entry.value().sweep();
        }
        removed
    }

    /// Snapshot of live leases across all backends.
    pub fn all_leases(&self) -> Vec<Lease> {
        let mut all = Vec::new();
        for entry in self.leasors.iter() {
            all.extend(entry.value().leases());
        }
        all
    }
}
