use crate::metrics_defs::EXTRA_SERVICES_SIZE;
use indexmap::IndexSet;
use parking_lot::RwLock;
use shared::gauge;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_MAX_EXTRA_SERVICES: usize = 64;

/// Service names discovered at runtime, reported alongside the client's own service.
///
/// Insertion ordered and bounded. Once full, new names are dropped and the first dropped
/// name is logged. Safe to share between threads.
pub struct ExtraServices {
    // The bound and insertion order are checked and updated under one write lock. A
    // lock-free map would need a separate counter that races with the bound.
    services: RwLock<IndexSet<String>>,
    max: usize,
    limit_logged: AtomicBool,
}

impl ExtraServices {
    pub fn new(max: usize) -> Self {
        ExtraServices {
            services: RwLock::new(IndexSet::new()),
            max,
            limit_logged: AtomicBool::new(false),
        }
    }

    /// Returns true if the name was added.
    pub fn add(&self, service: &str) -> bool {
        if service.is_empty() {
            return false;
        }

        if self.services.read().contains(service) {
            return false;
        }

        let mut services = self.services.write();
        if services.contains(service) {
            return false;
        }

        if services.len() >= self.max {
            if !self.limit_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    max = self.max,
                    service,
                    "Extra service limit reached, further services are not reported"
                );
            }
            return false;
        }

        services.insert(service.to_string());
        gauge!(EXTRA_SERVICES_SIZE).set(services.len() as f64);
        true
    }

    /// Current names in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.services.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExtraServices {
    fn default() -> Self {
        ExtraServices::new(DEFAULT_MAX_EXTRA_SERVICES)
    }
}
