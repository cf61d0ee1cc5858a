//! Liveness supervision of VPN interfaces.
//!
//! One task per interface probes reachability through that interface, feeds
//! the outcome to a [`Debouncer`], and on a transition updates the registry
//! and then notifies the synthesizer. The task stops before its next round
//! once the stop channel flips, and never touches the registry afterwards.

use crate::registry::Registry;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use vpnmanager_core::nft::IfName;
use vpnmanager_core::{Debouncer, LinkStatus, ManagerConfig};

/// Reachability check of one target through one interface.
///
/// An unreachable target is a normal outcome, not an error.
pub trait Reachability: Send + Sync + 'static {
    fn check(&self, iface: &IfName, target: &str, timeout: Duration) -> bool;
}

/// ICMP echo via the system `ping`, bound to the interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingReachability;

impl Reachability for PingReachability {
    fn check(&self, iface: &IfName, target: &str, timeout: Duration) -> bool {
        let wait_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        Command::new("ping")
            .args(["-n", "-q", "-c", "1", "-W", &wait_secs.to_string(), "-I"])
            .arg(iface.as_str())
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Probe parameters shared by every interface of one generation.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub targets: Arc<[String]>,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
}

impl ProbeSettings {
    pub fn from_config(cfg: &ManagerConfig) -> Self {
        Self {
            targets: cfg.probe_addresses.clone().into(),
            timeout: cfg.probe_timeout,
            failure_threshold: cfg.failure_threshold,
            recovery_threshold: cfg.recovery_threshold,
        }
    }
}

/// Edge notification sent to the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub status: LinkStatus,
}

/// One probe round: reachable if any target answers. No targets means the
/// interface is assumed reachable.
async fn probe_round(
    reachability: &Arc<dyn Reachability>,
    iface: &IfName,
    settings: &ProbeSettings,
) -> bool {
    if settings.targets.is_empty() {
        return true;
    }
    let reachability = Arc::clone(reachability);
    let iface = iface.clone();
    let targets = Arc::clone(&settings.targets);
    let timeout = settings.timeout;
    tokio::task::spawn_blocking(move || {
        targets
            .iter()
            .any(|target| reachability.check(&iface, target, timeout))
    })
    .await
    .unwrap_or(false)
}

/// Supervision loop for one interface. Runs until `stop` becomes true, its
/// sender is dropped, or the notification receiver is gone.
pub async fn supervise(
    iface: IfName,
    settings: ProbeSettings,
    reachability: Arc<dyn Reachability>,
    registry: Registry,
    notify: mpsc::UnboundedSender<StatusChange>,
    mut stop: watch::Receiver<bool>,
) {
    let mut debouncer = Debouncer::new(settings.failure_threshold, settings.recovery_threshold);
    tracing::debug!(iface = %iface, "probe started");

    loop {
        if *stop.borrow() {
            break;
        }

        let reachable = tokio::select! {
            biased;
            _ = stop.changed() => break,
            ok = probe_round(&reachability, &iface, &settings) => ok,
        };
        if *stop.borrow() {
            break;
        }

        if let Some(status) = debouncer.observe(reachable) {
            registry.set_status(iface.as_str(), status);
            tracing::info!(iface = %iface, %status, "link status changed");
            let change = StatusChange {
                name: iface.to_string(),
                status,
            };
            if notify.send(change).is_err() {
                break;
            }
        }

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = tokio::time::sleep(settings.timeout) => {}
        }
    }

    tracing::debug!(iface = %iface, "probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use vpnmanager_core::VpnInterface;

    /// Replays scripted outcomes, then repeats the last one.
    struct Scripted(Mutex<VecDeque<bool>>);

    impl Reachability for Scripted {
        fn check(&self, _iface: &IfName, _target: &str, _timeout: Duration) -> bool {
            let mut q = self.0.lock().unwrap();
            if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                *q.front().unwrap()
            }
        }
    }

    fn settings(timeout_ms: u64, failure_threshold: u32) -> ProbeSettings {
        ProbeSettings {
            targets: vec!["192.0.2.1".to_string()].into(),
            timeout: Duration::from_millis(timeout_ms),
            failure_threshold,
            recovery_threshold: 1,
        }
    }

    fn registry() -> Registry {
        Registry::new(&[VpnInterface {
            name: "wg0".parse().unwrap(),
            weight: 1,
            mark: "0x1".parse().unwrap(),
            route_table: None,
        }])
    }

    #[tokio::test]
    async fn test_notifies_once_per_transition() {
        let reach: Arc<dyn Reachability> =
            Arc::new(Scripted(Mutex::new(VecDeque::from([true, true, false, false, true]))));
        let registry = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            "wg0".parse().unwrap(),
            settings(5, 2),
            reach,
            registry.clone(),
            tx,
            stop_rx,
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, LinkStatus::Available);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, LinkStatus::Unavailable);
        assert_eq!(registry.snapshot()[0].status, Some(LinkStatus::Unavailable));
        let third = rx.recv().await.unwrap();
        assert_eq!(third.status, LinkStatus::Available);

        // Stable from here on: no further notifications.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_task_without_further_updates() {
        let reach: Arc<dyn Reachability> = Arc::new(Scripted(Mutex::new(VecDeque::from([false]))));
        let registry = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            "wg0".parse().unwrap(),
            settings(10_000, 1),
            reach,
            registry.clone(),
            tx,
            stop_rx,
        ));

        assert_eq!(rx.recv().await.unwrap().status, LinkStatus::Unavailable);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("probe must exit promptly")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_no_targets_means_available() {
        let reach: Arc<dyn Reachability> = Arc::new(Scripted(Mutex::new(VecDeque::from([false]))));
        let mut s = settings(5, 1);
        s.targets = Vec::<String>::new().into();
        assert!(probe_round(&reach, &"wg0".parse().unwrap(), &s).await);
    }
}
