//! Source of resolved bypass-domain addresses.
//!
//! The resolver that maps bypass domains to addresses runs outside this
//! process. At start the controller asks a [`DomainIpSource`] for the current
//! list and seeds the domain bypass set with it; later updates arrive through
//! the `allow` subcommands.

use anyhow::{Context, Result};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub trait DomainIpSource: Send + Sync + 'static {
    fn current_ips(&self) -> Result<Vec<Ipv4Addr>>;
}

/// Newline-separated addresses; blank lines and `#` comments are skipped.
/// A missing file is an empty list.
#[derive(Debug, Clone)]
pub struct FileDomainIps {
    path: PathBuf,
}

impl FileDomainIps {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DomainIpSource for FileDomainIps {
    fn current_ips(&self) -> Result<Vec<Ipv4Addr>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read domain ip file: {}", self.path.display()))?;
        raw.lines()
            .map(|l| l.split('#').next().unwrap_or_default().trim())
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<Ipv4Addr>().with_context(|| {
                    format!("invalid address '{l}' in {}", self.path.display())
                })
            })
            .collect()
    }
}
