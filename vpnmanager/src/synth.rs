//! Rule synthesis for the `vpn` chain.
//!
//! All passes go through one worker task that owns the receiving end of the
//! status channel, so two passes never interleave. Each pass replaces the
//! chain contents in a single `nft -f` transaction.

use crate::gateway::Gateway;
use crate::probe::StatusChange;
use crate::registry::Registry;
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use vpnmanager_core::{nft, Distribution};

#[derive(Clone)]
pub struct RuleSynthesizer {
    gateway: Gateway,
    registry: Registry,
}

impl RuleSynthesizer {
    pub fn new(gateway: Gateway, registry: Registry) -> Self {
        Self { gateway, registry }
    }

    /// Compute the distribution from current statuses and install it.
    pub async fn synthesize(&self) -> Result<Distribution> {
        let paths = self.registry.available_paths();
        let distribution = Distribution::compute(&paths);
        self.gateway
            .apply(nft::vpn_chain_command(&distribution))
            .await
            .context("failed to install vpn chain rules")?;
        log_distribution(&distribution);
        Ok(distribution)
    }

    /// Consume status changes until the channel closes.
    ///
    /// Changes queued while a pass runs are coalesced into the next pass.
    /// A failed pass is logged; the next change retries.
    pub async fn run(self, mut changes: mpsc::UnboundedReceiver<StatusChange>) {
        while let Some(change) = changes.recv().await {
            let mut coalesced = 1usize;
            while changes.try_recv().is_ok() {
                coalesced += 1;
            }
            tracing::debug!(
                iface = %change.name,
                status = %change.status,
                coalesced,
                "resynthesizing vpn rules"
            );
            if let Err(e) = self.synthesize().await {
                tracing::error!(error = %format!("{e:#}"), "rule synthesis failed");
            }
        }
        tracing::debug!("rule synthesizer stopped");
    }
}

fn log_distribution(distribution: &Distribution) {
    match distribution {
        Distribution::Reject => tracing::warn!("no VPN interface available, rejecting LAN traffic"),
        Distribution::Single(mark) => tracing::info!(%mark, "single VPN interface available"),
        Distribution::Weighted(table) => {
            let buckets: Vec<String> = table
                .buckets()
                .iter()
                .map(|b| format!("{}-{}:{}", b.start, b.end, b.mark))
                .collect();
            tracing::info!(buckets = %buckets.join(" "), "weighted distribution installed");
        }
    }
}
