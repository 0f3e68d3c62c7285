//! Hot reload of the configuration file.
//!
//! The watcher observes the file's parent directory so editors that save by
//! rename still trigger a reload. Only configurations that parse and
//! validate reach the update stream.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// Loads the config file and pushes it into the update stream.
#[derive(Debug, Clone)]
pub struct Reloader {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl Reloader {
    /// Returns whether a valid configuration was queued.
    pub fn reload(&self) -> bool {
        match load_config(&self.path) {
            Ok(config) => self.update_tx.send(config).is_ok(),
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to reload config, keeping current configuration");
                false
            }
        }
    }
}

pub struct ConfigWatcher {
    reloader: Reloader,
}

impl ConfigWatcher {
    /// Returns the watcher and the stream of validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let reloader = Reloader {
            path: path.to_path_buf(),
            update_tx,
        };
        (Self { reloader }, update_rx)
    }

    /// Handle for reloads not driven by the filesystem (SIGHUP).
    pub fn reloader(&self) -> Reloader {
        self.reloader.clone()
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let file = self.reloader.path.clone();
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let reloader = self.reloader;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if touches(&event, &reloader.path) => {
                    tracing::info!(path = ?reloader.path, kind = ?event.kind, "Config file changed");
                    reloader.reload();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?file, "Config watcher started");
        Ok(watcher)
    }
}

/// A content change to `file` (writes, creates, renames onto it).
fn touches(event: &Event, file: &Path) -> bool {
    let relevant = event.kind.is_modify() || event.kind.is_create();
    relevant && event.paths.iter().any(|p| p.file_name() == file.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_changes_to_the_config_file_count() {
        let file = Path::new("/etc/gateway/gateway.toml");
        assert!(touches(&event(EventKind::Modify(ModifyKind::Any), "/etc/gateway/gateway.toml"), file));
        assert!(touches(&event(EventKind::Create(CreateKind::File), "/etc/gateway/gateway.toml"), file));
        assert!(!touches(&event(EventKind::Modify(ModifyKind::Any), "/etc/gateway/other.toml"), file));
        assert!(!touches(&event(EventKind::Access(notify::event::AccessKind::Any), "/etc/gateway/gateway.toml"), file));
    }

    #[test]
    fn reload_queues_only_valid_configs() {
        let dir = std::env::temp_dir().join(format!("gateway-watch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let reloader = watcher.reloader();

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(!reloader.reload());

        std::fs::write(
            &path,
            r#"
            [routing]
            default_pool = "api"

            [[backends]]
            name = "a"
            group = "api"
            address = "127.0.0.1:9000"
            "#,
        )
        .unwrap();
        assert!(reloader.reload());
        assert_eq!(rx.try_recv().unwrap().backends.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
