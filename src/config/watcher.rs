//! Reloads the channel config when its file changes.
//!
//! Only the health policy and owned services take effect at runtime; the
//! rest of a reloaded config is read by nothing after startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ChannelConfig;

pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ChannelConfig>,
}

impl ConfigWatcher {
    /// The receiver feeds `Channel::follow_config`.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ChannelConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Updates stop when the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, update_tx } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload(&watched, &update_tx);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Watching channel config");
        Ok(watcher)
    }
}

/// Load the file and push it. A bad file keeps the running config.
fn reload(path: &Path, tx: &mpsc::UnboundedSender<ChannelConfig>) -> bool {
    match load_config(path) {
        Ok(config) => {
            tracing::info!(path = ?path, host_port = %config.host_port, "Channel config reloaded");
            tx.send(config).is_ok()
        }
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "Rejected config reload, keeping current config");
            false
        }
    }
}
