//! Per-interface runtime state shared by probe tasks and the synthesizer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use vpnmanager_core::{LinkStatus, VpnInterface, WeightedPath};

/// Runtime state of one configured VPN interface.
#[derive(Debug)]
pub struct InterfaceRuntimeState {
    pub spec: VpnInterface,
    /// `None` until the first probe round completes
    pub status: Option<LinkStatus>,
    pub changed_at: Option<Instant>,
    probe: Option<JoinHandle<()>>,
}

/// Read-only view of an [`InterfaceRuntimeState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub weight: i64,
    pub mark: String,
    pub status: Option<LinkStatus>,
    pub since_change: Option<Duration>,
}

/// Interface states of one configuration generation, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Vec<InterfaceRuntimeState>>>,
}

impl Registry {
    pub fn new(specs: &[VpnInterface]) -> Self {
        let states = specs
            .iter()
            .cloned()
            .map(|spec| InterfaceRuntimeState {
                spec,
                status: None,
                changed_at: None,
                probe: None,
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(states)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InterfaceRuntimeState>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a transition. Returns false for an unknown interface.
    pub fn set_status(&self, name: &str, status: LinkStatus) -> bool {
        let mut states = self.lock();
        let Some(state) = states.iter_mut().find(|s| s.spec.name.as_str() == name) else {
            return false;
        };
        state.status = Some(status);
        state.changed_at = Some(Instant::now());
        true
    }

    pub fn attach_probe(&self, name: &str, handle: JoinHandle<()>) {
        let mut states = self.lock();
        match states.iter_mut().find(|s| s.spec.name.as_str() == name) {
            Some(state) => state.probe = Some(handle),
            None => handle.abort(),
        }
    }

    /// Detach every probe handle so the caller can await them unlocked.
    pub fn take_probes(&self) -> Vec<JoinHandle<()>> {
        self.lock().iter_mut().filter_map(|s| s.probe.take()).collect()
    }

    pub fn all_observed(&self) -> bool {
        self.lock().iter().all(|s| s.status.is_some())
    }

    /// Available interfaces as distribution input, in configuration order.
    pub fn available_paths(&self) -> Vec<WeightedPath> {
        self.lock()
            .iter()
            .filter(|s| s.status.is_some_and(|st| st.is_available()))
            .map(|s| s.spec.weighted_path())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<InterfaceSnapshot> {
        self.lock()
            .iter()
            .map(|s| InterfaceSnapshot {
                name: s.spec.name.to_string(),
                weight: s.spec.weight,
                mark: s.spec.mark.to_string(),
                status: s.status,
                since_change: s.changed_at.map(|t| t.elapsed()),
            })
            .collect()
    }
}
