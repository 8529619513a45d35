//! Port registry
//!
//! Sole local authority over port ownership. A claim must pass three
//! checks in order: the reserved tier, the active tier, and a live bind
//! test. Rejections are returned as data with a suggested alternative.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sk_core::config::PortsConfig;
use sk_core::error::PortError;
use sk_core::ports::{
    CategoryRange, PortAllocation, PortCategory, PortOutcome, PortStatusReport,
    ServiceValidation,
};
use sk_core::time::current_time_millis;

use super::probe::{Availability, OsPortProbe, PortProbe};

/// Two-tier port table backed by live OS checks
pub struct PortRegistry {
    /// Loaded once, never mutated
    reserved: BTreeMap<u16, PortAllocation>,
    /// Runtime claims. Never held across an await.
    active: Mutex<BTreeMap<u16, PortAllocation>>,
    ranges: Vec<CategoryRange>,
    probe: Arc<dyn PortProbe>,
}

impl PortRegistry {
    /// Create a registry that probes real sockets
    pub fn new(config: &PortsConfig) -> Self {
        Self::with_probe(config, Arc::new(OsPortProbe))
    }

    /// Create a registry with a custom probe
    pub fn with_probe(config: &PortsConfig, probe: Arc<dyn PortProbe>) -> Self {
        let reserved = config
            .reserved
            .iter()
            .map(|r| (r.port, PortAllocation::reserved(r.port, r.service.clone())))
            .collect();

        Self {
            reserved,
            active: Mutex::new(BTreeMap::new()),
            ranges: config.ranges.clone(),
            probe,
        }
    }

    fn active(&self) -> MutexGuard<'_, BTreeMap<u16, PortAllocation>> {
        // A panic elsewhere cannot leave the map half-written
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the port can be bound right now
    pub fn check(&self, port: u16) -> bool {
        self.probe.check(port).is_free()
    }

    /// Service a port is reserved for
    pub fn reserved_owner(&self, port: u16) -> Option<&str> {
        self.reserved.get(&port).map(|a| a.service.as_str())
    }

    /// Record an active allocation for `service`.
    ///
    /// Re-claiming a port already held by the same service succeeds and
    /// refreshes its start time.
    pub fn claim(
        &self,
        port: u16,
        service: &str,
        pid: Option<u32>,
    ) -> Result<PortAllocation, PortError> {
        if port == 0 {
            return Err(PortError::InvalidPort);
        }
        self.check_reserved(port, service)?;

        let mut active = self.active();
        if let Some(existing) = active.get(&port) {
            if existing.service != service {
                return Err(PortError::ClaimedByOther {
                    port,
                    owner: existing.service.clone(),
                    service: service.to_string(),
                });
            }
        }

        match self.probe.check(port) {
            Availability::Free => {
                let allocation = PortAllocation::active(port, service, pid, current_time_millis());
                active.insert(port, allocation.clone());
                tracing::info!(port, service, "Port claimed");
                Ok(allocation)
            }
            Availability::InUse => {
                drop(active);
                Err(self.in_use(port))
            }
            Availability::Unavailable(reason) => Err(PortError::Unavailable { port, reason }),
        }
    }

    /// `claim` as a structured outcome, with a suggestion on rejection
    pub fn claim_outcome(&self, port: u16, service: &str, pid: Option<u32>) -> PortOutcome {
        match self.claim(port, service, pid) {
            Ok(allocation) => {
                let message = format!("Port {} claimed for {}", port, service);
                PortOutcome::granted(allocation, message)
            }
            Err(e) => {
                tracing::warn!(port, service, "Port claim rejected: {}", e);
                PortOutcome::rejected(port, e.to_string(), self.suggest_available(service).ok())
            }
        }
    }

    /// Remove an active allocation. Reserved ports can never be released.
    pub fn release(&self, port: u16) -> Result<PortAllocation, PortError> {
        if let Some(owner) = self.reserved_owner(port) {
            return Err(PortError::ReservedRelease {
                port,
                owner: owner.to_string(),
            });
        }

        let released = self.active().remove(&port).ok_or(PortError::NotAllocated(port))?;
        tracing::info!(port, service = %released.service, "Port released");
        Ok(released)
    }

    /// Remove the active allocation on `port` if `service` holds it.
    /// Unlike `release` this works on reserved ports, so a service can give
    /// back its own designated port when it shuts down.
    pub(crate) fn drop_claim(&self, port: u16, service: &str) -> Option<PortAllocation> {
        let mut active = self.active();
        if active.get(&port).map(|a| a.service.as_str()) != Some(service) {
            return None;
        }
        let dropped = active.remove(&port);
        tracing::info!(port, service, "Port claim dropped");
        dropped
    }

    /// First port in the service's category range with no reserved or
    /// active allocation. Bookkeeping only; does not touch the OS.
    pub fn suggest_alternative(&self, service: &str) -> Result<u16, PortError> {
        self.scan_range(service, |_| true)
    }

    /// Like `suggest_alternative`, but also skips ports that fail a live
    /// bind test
    pub fn suggest_available(&self, service: &str) -> Result<u16, PortError> {
        self.scan_range(service, |port| self.check(port))
    }

    fn scan_range(&self, service: &str, usable: impl Fn(u16) -> bool) -> Result<u16, PortError> {
        let range = self.range_for(PortCategory::from_service(service));
        let taken: Vec<u16> = self.active().keys().copied().collect();

        (range.start..=range.end)
            .filter(|port| !self.reserved.contains_key(port) && !taken.contains(port))
            .find(|port| usable(*port))
            .ok_or_else(|| PortError::RangeExhausted {
                service: service.to_string(),
                start: range.start,
                end: range.end,
            })
    }

    fn range_for(&self, category: PortCategory) -> CategoryRange {
        self.ranges
            .iter()
            .copied()
            .find(|r| r.category == category)
            // Validated configs carry every category
            .unwrap_or(CategoryRange::new(category, 0, 0))
    }

    /// Would `claim` succeed? Answers without claiming, and offers an
    /// alternative when it would not. With no port, just suggests one.
    pub fn validate_service(&self, service: &str, requested: Option<u16>) -> ServiceValidation {
        let category = PortCategory::from_service(service);
        let mut validation = ServiceValidation {
            service: service.to_string(),
            category,
            requested_port: requested,
            valid: false,
            port: None,
            message: String::new(),
        };

        let Some(port) = requested else {
            match self.suggest_available(service) {
                Ok(suggested) => {
                    let range = self.range_for(category);
                    validation.valid = true;
                    validation.port = Some(suggested);
                    validation.message = format!(
                        "Use port {} for {} ({} range {}-{})",
                        suggested, service, category, range.start, range.end
                    );
                }
                Err(e) => validation.message = e.to_string(),
            }
            return validation;
        };

        match self.would_claim(port, service) {
            Ok(()) => {
                validation.valid = true;
                validation.port = Some(port);
                validation.message = format!("Port {} is available for {}", port, service);
            }
            Err(conflict) => {
                let suggestion = self.suggest_available(service).ok();
                validation.port = suggestion;
                validation.message = match suggestion {
                    Some(alt) => format!("{} Suggested alternative: {}", conflict, alt),
                    None => conflict.to_string(),
                };
            }
        }
        validation
    }

    fn would_claim(&self, port: u16, service: &str) -> Result<(), PortError> {
        if port == 0 {
            return Err(PortError::InvalidPort);
        }
        self.check_reserved(port, service)?;
        if let Some(existing) = self.active().get(&port) {
            if existing.service != service {
                return Err(PortError::ClaimedByOther {
                    port,
                    owner: existing.service.clone(),
                    service: service.to_string(),
                });
            }
        }
        match self.probe.check(port) {
            Availability::Free => Ok(()),
            Availability::InUse => Err(self.in_use(port)),
            Availability::Unavailable(reason) => Err(PortError::Unavailable { port, reason }),
        }
    }

    fn check_reserved(&self, port: u16, service: &str) -> Result<(), PortError> {
        match self.reserved_owner(port) {
            Some(owner) if owner != service => Err(PortError::ReservedForOther {
                port,
                owner: owner.to_string(),
                service: service.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn in_use(&self, port: u16) -> PortError {
        let owner = self.probe.owner(port);
        PortError::InUse {
            port,
            process: owner.as_ref().and_then(|o| o.name.clone()),
            pid: owner.map(|o| o.pid),
        }
    }

    /// Port a named service is using here: active claims first, then the
    /// reserved table
    pub fn lookup_service(&self, service: &str) -> Option<u16> {
        let active = self
            .active()
            .values()
            .find(|a| a.service == service)
            .map(|a| a.port);
        active.or_else(|| {
            self.reserved
                .values()
                .find(|a| a.service == service)
                .map(|a| a.port)
        })
    }

    /// Current active claims, by port
    pub fn active_claims(&self) -> Vec<PortAllocation> {
        self.active().values().cloned().collect()
    }

    /// Snapshot of both tiers and the category ranges
    pub fn status(&self) -> PortStatusReport {
        PortStatusReport {
            reserved: self.reserved.values().cloned().collect(),
            active: self.active_claims(),
            ranges: self.ranges.clone(),
        }
    }
}
