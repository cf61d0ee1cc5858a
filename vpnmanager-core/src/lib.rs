//! Core library for the VPN uplink manager.
//!
//! The manager supervises several outbound VPN interfaces and programs an
//! nftables table so that new LAN connections are spread across the reachable
//! ones by weight, while established connections stay on the path they
//! started on.
//!
//! # Architecture
//!
//! This crate holds the pieces that do not touch the host:
//!
//! - `control`: Configuration document and validation
//! - `distribution`: Weighted bucket calculation over `[0, 99]`
//! - `liveness`: Probe outcome debouncing into status transitions
//! - `nft`: Typed model of the `vpn_manager` table and its commands
//! - `route`: Policy routing commands for marked traffic
//! - `command`: Description of external program invocations
//!
//! # Example
//!
//! ```
//! use vpnmanager_core::distribution::{Distribution, WeightedPath};
//! use vpnmanager_core::nft;
//!
//! let paths = [
//!     WeightedPath::new("0x1".parse().unwrap(), 1),
//!     WeightedPath::new("0x2".parse().unwrap(), 1),
//! ];
//! let script = nft::vpn_chain_script(&Distribution::compute(&paths));
//! assert!(script.contains("0-50 : 0x1, 51-99 : 0x2"));
//! ```

pub mod command;
pub mod control;
pub mod distribution;
pub mod liveness;
pub mod nft;
pub mod route;

pub use command::{CommandError, SystemCommand};
pub use control::{ConfigError, ManagerConfig, VpnInterface};
pub use distribution::{Distribution, DistributionTable, WeightedPath};
pub use liveness::{Debouncer, LinkStatus};
