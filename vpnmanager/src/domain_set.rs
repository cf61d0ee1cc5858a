//! Dynamic bypass set for addresses of domains that skip the VPN.
//!
//! Each operation is one `nft` command. Empty add/remove are no-ops.

use crate::gateway::Gateway;
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use vpnmanager_core::nft::SetOp;

#[derive(Clone)]
pub struct DomainAllowSet {
    gateway: Gateway,
}

impl DomainAllowSet {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    async fn apply(&self, op: SetOp) -> Result<()> {
        let Some(cmd) = op.command() else {
            return Ok(());
        };
        self.gateway.apply(cmd).await?;
        Ok(())
    }

    pub async fn add(&self, ips: &[Ipv4Addr]) -> Result<()> {
        self.apply(SetOp::Add(ips.to_vec())).await.with_context(|| {
            format!(
                "failed to add {} address(es) to domain bypass set",
                ips.len()
            )
        })
    }

    pub async fn remove(&self, ips: &[Ipv4Addr]) -> Result<()> {
        self.apply(SetOp::Delete(ips.to_vec())).await.with_context(|| {
            format!(
                "failed to remove {} address(es) from domain bypass set",
                ips.len()
            )
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.apply(SetOp::Flush)
            .await
            .context("failed to flush domain bypass set")
    }
}
