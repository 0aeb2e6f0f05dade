//! Hot reload of the configuration file.

use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ServerConfig;

/// Watches one config file and publishes every valid new version.
///
/// The parent directory is watched so that editors which replace the file
/// through a rename are still seen. Invalid versions are logged and skipped;
/// the running configuration stays in place.
pub struct ConfigWatcher {
    // Dropping the notify handle stops the watch.
    _inner: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    pub fn start(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<ServerConfig>), notify::Error> {
        let (reloads, rx) = mpsc::unbounded_channel();
        let target = path.to_path_buf();
        let file_name = target.file_name().map(|n| n.to_os_string());

        let on_event = {
            let target = target.clone();
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let ours = event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !ours {
                    return;
                }
                match load_config(&target) {
                    Ok(config) => {
                        tracing::info!(path = %target.display(), "Configuration reloaded");
                        let _ = reloads.send(config);
                    }
                    Err(e) => tracing::error!(path = %target.display(), error = %e, "Rejected config change"),
                }
            }
        };

        let mut inner = notify::recommended_watcher(on_event)?;
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        inner.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %target.display(), "Watching configuration");

        Ok((Self { _inner: inner, path: target }, rx))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
