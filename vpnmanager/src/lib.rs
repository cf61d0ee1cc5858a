//! Daemon side of vpnmanager: command execution, liveness probing, rule
//! synthesis and the lifecycle controller.

pub mod cli;
pub mod config;
pub mod domain_set;
pub mod feed;
pub mod gateway;
pub mod probe;
pub mod registry;
pub mod runtime;
pub mod synth;
