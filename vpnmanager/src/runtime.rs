//! Lifecycle of one manager process.
//!
//! ```text
//! Uninitialized --start--> Running --reload--> Reloading --> Running
//!                             |                                 |
//!                             +------------stop----------> Stopped
//! ```
//!
//! A failed start or reload ends in `Failed`; the next reload starts again.
//!
//! A running generation owns its registry, probe tasks, synthesizer worker
//! and the host state it installed. Lifecycle operations hold one async
//! mutex for their whole duration, so a reload never interleaves with
//! another reload or with `stop`.

use crate::domain_set::DomainAllowSet;
use crate::feed::{DomainIpSource, FileDomainIps};
use crate::gateway::Gateway;
use crate::probe::{self, ProbeSettings, Reachability};
use crate::registry::{InterfaceSnapshot, Registry};
use crate::synth::RuleSynthesizer;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use vpnmanager_core::{nft, ManagerConfig, SystemCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Running,
    Reloading,
    Stopped,
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::Reloading => "reloading",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything one configuration generation installed or spawned.
struct Generation {
    registry: Registry,
    stop_tx: watch::Sender<bool>,
    synthesizer: Option<JoinHandle<()>>,
    route_teardown: Vec<SystemCommand>,
    table_installed: bool,
}

impl Generation {
    fn new(registry: Registry) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            stop_tx,
            synthesizer: None,
            route_teardown: Vec::new(),
            table_installed: false,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    config: Option<Arc<ManagerConfig>>,
    generation: Option<Generation>,
}

pub struct Controller {
    gateway: Gateway,
    reachability: Arc<dyn Reachability>,
    domain_source: Option<Arc<dyn DomainIpSource>>,
    domain_set: DomainAllowSet,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ControllerState>,
}

impl Controller {
    pub fn new(gateway: Gateway, reachability: Arc<dyn Reachability>) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Uninitialized);
        Self {
            domain_set: DomainAllowSet::new(gateway.clone()),
            gateway,
            reachability,
            domain_source: None,
            lifecycle: Mutex::new(Lifecycle::default()),
            state_tx,
        }
    }

    /// Use `source` for the bypass-domain seed instead of `domain_ip_file`.
    pub fn with_domain_source(mut self, source: Arc<dyn DomainIpSource>) -> Self {
        self.domain_source = Some(source);
        self
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    pub fn domain_set(&self) -> &DomainAllowSet {
        &self.domain_set
    }

    pub async fn config(&self) -> Option<Arc<ManagerConfig>> {
        self.lifecycle.lock().await.config.clone()
    }

    /// Interface states of the running generation, in configuration order.
    pub async fn interfaces(&self) -> Vec<InterfaceSnapshot> {
        match &self.lifecycle.lock().await.generation {
            Some(generation) => generation.registry.snapshot(),
            None => Vec::new(),
        }
    }

    fn set_state(&self, state: ControllerState) {
        self.state_tx.send_replace(state);
        tracing::debug!(%state, "controller state");
    }

    /// Install the table, start probing, and install the first distribution.
    ///
    /// Any failure tears down what was already installed and is returned.
    pub async fn start(&self, config: ManagerConfig) -> Result<()> {
        config.validate().context("invalid configuration")?;
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation.is_some() {
            bail!("controller is already running");
        }
        self.start_locked(&mut lifecycle, Arc::new(config)).await
    }

    /// Replace the running generation with one built from `config`.
    ///
    /// An invalid config leaves the running generation untouched. After an
    /// explicit `stop`, or before the first `start`, the config is only
    /// stored. After a failed start or reload this starts again.
    pub async fn reload(&self, config: ManagerConfig) -> Result<()> {
        config.validate().context("invalid configuration")?;
        let config = Arc::new(config);
        let mut lifecycle = self.lifecycle.lock().await;

        match lifecycle.generation.take() {
            Some(generation) => {
                tracing::info!("reloading configuration");
                self.set_state(ControllerState::Reloading);
                self.tear_down(generation).await;
            }
            None if self.state() == ControllerState::Failed => {
                tracing::info!("retrying start with updated configuration");
                self.set_state(ControllerState::Reloading);
            }
            None => {
                tracing::info!("configuration updated while not running");
                lifecycle.config = Some(config);
                return Ok(());
            }
        }

        self.start_locked(&mut lifecycle, config)
            .await
            .context("restart after reload failed")
    }

    /// Stop probing and remove everything the running generation installed.
    ///
    /// Teardown is best-effort; calling this when not running does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(generation) = lifecycle.generation.take() else {
            tracing::debug!("stop requested but controller is not running");
            return;
        };
        tracing::info!("stopping");
        self.tear_down(generation).await;
        self.set_state(ControllerState::Stopped);
    }

    async fn start_locked(
        &self,
        lifecycle: &mut Lifecycle,
        config: Arc<ManagerConfig>,
    ) -> Result<()> {
        lifecycle.config = Some(Arc::clone(&config));
        let mut generation = Generation::new(Registry::new(&config.vpn_interfaces));

        match self.bring_up(&config, &mut generation).await {
            Ok(()) => {
                lifecycle.generation = Some(generation);
                self.set_state(ControllerState::Running);
                tracing::info!(
                    interfaces = config.vpn_interfaces.len(),
                    "controller running"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "start failed, tearing down");
                self.tear_down(generation).await;
                self.set_state(ControllerState::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, config: &ManagerConfig, generation: &mut Generation) -> Result<()> {
        let base = config.base_table();
        generation.table_installed = true;
        self.gateway
            .apply(base.install_command())
            .await
            .context("failed to create nftables table")?;
        tracing::info!(
            lan = base.lan_interfaces.len(),
            bypass = base.bypass.len(),
            "nftables table installed"
        );

        for route in config.policy_routes() {
            if let Err(e) = self.gateway.apply(route.stale_rule_cleanup()).await {
                tracing::debug!(error = %e, "no stale policy rule to remove");
            }
            generation.route_teardown.extend(route.teardown());
            for cmd in route.install() {
                self.gateway.apply(cmd).await.with_context(|| {
                    format!("failed to install policy route for '{}'", route.ifname)
                })?;
            }
            tracing::info!(iface = %route.ifname, table = route.table, "policy route installed");
        }

        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let settings = ProbeSettings::from_config(config);
        for iface in &config.vpn_interfaces {
            let handle = tokio::spawn(probe::supervise(
                iface.name.clone(),
                settings.clone(),
                Arc::clone(&self.reachability),
                generation.registry.clone(),
                change_tx.clone(),
                generation.stop_tx.subscribe(),
            ));
            generation.registry.attach_probe(iface.name.as_str(), handle);
        }
        drop(change_tx);

        while !generation.registry.all_observed() {
            if change_rx.recv().await.is_none() {
                bail!("probe tasks exited before reporting a first status");
            }
        }

        let synthesizer = RuleSynthesizer::new(self.gateway.clone(), generation.registry.clone());
        synthesizer
            .synthesize()
            .await
            .context("initial rule synthesis failed")?;
        generation.synthesizer = Some(tokio::spawn(synthesizer.run(change_rx)));

        self.seed_domain_ips(config).await;
        Ok(())
    }

    /// Push the resolver's current addresses. Failures are logged only.
    async fn seed_domain_ips(&self, config: &ManagerConfig) {
        let source: Arc<dyn DomainIpSource> = match (&self.domain_source, &config.domain_ip_file) {
            (Some(source), _) => Arc::clone(source),
            (None, Some(path)) => Arc::new(FileDomainIps::new(path.clone())),
            (None, None) => return,
        };

        let ips = match tokio::task::spawn_blocking(move || source.current_ips()).await {
            Ok(Ok(ips)) => ips,
            Ok(Err(e)) => {
                tracing::error!(
                    error = %format!("{e:#}"),
                    "failed to read bypass-domain addresses"
                );
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "bypass-domain source panicked");
                return;
            }
        };
        if ips.is_empty() {
            return;
        }
        match self.domain_set.add(&ips).await {
            Ok(()) => tracing::info!(count = ips.len(), "seeded domain bypass set"),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "failed to seed domain bypass set")
            }
        }
    }

    /// Best-effort teardown: every step runs even if an earlier one failed.
    async fn tear_down(&self, mut generation: Generation) {
        generation.stop_tx.send_replace(true);
        for handle in generation.registry.take_probes() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "probe task ended abnormally");
            }
        }
        // The probes held the only senders, so the worker drains and exits.
        if let Some(worker) = generation.synthesizer.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "rule synthesizer ended abnormally");
            }
        }

        for cmd in generation.route_teardown.drain(..) {
            self.gateway.apply_best_effort(cmd, "remove policy route").await;
        }
        if generation.table_installed {
            self.gateway
                .apply_best_effort(nft::delete_table_command(), "delete nftables table")
                .await;
        }
        tracing::info!("generation torn down");
    }
}
