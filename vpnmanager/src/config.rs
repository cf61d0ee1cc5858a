use anyhow::{Context, Result};
use directories::ProjectDirs;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vpnmanager_core::ManagerConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const SYSTEM_CONFIG_PATH: &str = "/etc/vpnmanager/config.toml";

/// Quiet period after a file event before the file is re-read.
const SETTLE: Duration = Duration::from_millis(200);

/// The system path if it exists, otherwise the per-user config directory.
pub fn default_config_path() -> Result<PathBuf> {
    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return Ok(system);
    }
    let proj = ProjectDirs::from("org", "vpnmanager", "vpnmanager")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Read and parse `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<ManagerConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(ManagerConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: ManagerConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// [`load`] followed by cross-field validation.
pub fn load_validated(path: &Path) -> Result<ManagerConfig> {
    let cfg = load(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &ManagerConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// Keeps the file watcher alive; dropping it ends the subscription.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `path` and deliver each valid configuration that differs from the
/// previous one. Unparsable or invalid contents are logged and skipped.
///
/// The parent directory is watched so editors that replace the file by
/// renaming are picked up.
pub fn watch(
    path: &Path,
    current: ManagerConfig,
) -> Result<(ConfigWatcher, mpsc::UnboundedReceiver<Arc<ManagerConfig>>)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(|n| n.to_os_string());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "config watcher error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let touches_config = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        if touches_config {
            let _ = event_tx.send(());
        }
    })
    .context("failed to create config watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch config directory: {}", dir.display()))?;

    let (cfg_tx, cfg_rx) = mpsc::unbounded_channel();
    let path = path.to_path_buf();
    let task = tokio::spawn(async move {
        let mut last = current;
        while event_rx.recv().await.is_some() {
            tokio::time::sleep(SETTLE).await;
            while event_rx.try_recv().is_ok() {}

            let cfg = match load_validated(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "ignoring config change");
                    continue;
                }
            };
            if cfg == last {
                tracing::debug!("config file touched without changes");
                continue;
            }
            last = cfg.clone();
            tracing::info!(path = %path.display(), "config changed");
            if cfg_tx.send(Arc::new(cfg)).is_err() {
                break;
            }
        }
    });

    Ok((
        ConfigWatcher {
            _watcher: watcher,
            task,
        },
        cfg_rx,
    ))
}
