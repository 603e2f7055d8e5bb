//! Host platform surfaces the core drives but does not own.
//!
//! The mini-program host provides key-value storage, toasts, navigation, a
//! place to save downloads, and the busy overlay. The core reaches them only
//! through these traits. The `Log*` and `Memory*` implementations back a
//! headless host for tools and tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::loading::{LoadingCoordinator, LoadingOverlay, OverlayError};

/// How long a toast stays on screen.
pub const TOAST_DURATION: Duration = Duration::from_millis(2000);

/// Opaque key-value storage for credentials and the cached profile.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastIcon {
    None,
    Success,
}

/// Transient, auto-dismissing user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
    pub icon: ToastIcon,
    pub duration: Duration,
}

impl Toast {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            icon: ToastIcon::None,
            duration: TOAST_DURATION,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            icon: ToastIcon::Success,
            duration: TOAST_DURATION,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn toast(&self, toast: Toast);
}

pub trait Navigator: Send + Sync {
    fn navigate_to(&self, route: &str);
}

/// Persists downloaded bytes and returns where they landed.
///
/// Called on the blocking pool, so implementations may do plain file I/O.
pub trait FileStorage: Send + Sync {
    fn save(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf>;
}

/// Everything the core needs from the host, bundled for injection.
#[derive(Clone)]
pub struct Host {
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn Notifier>,
    pub navigator: Arc<dyn Navigator>,
    pub storage: Arc<dyn FileStorage>,
    pub loading: Arc<LoadingCoordinator>,
}

impl Host {
    /// Host with in-memory storage, log-only UI, and downloads saved under
    /// `download_dir`.
    pub fn headless(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            notifier: Arc::new(LogNotifier),
            navigator: Arc::new(LogNavigator),
            storage: Arc::new(DirectoryStorage::new(download_dir)),
            loading: Arc::new(LoadingCoordinator::new(Arc::new(LogOverlay))),
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("loading", &self.loading).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn toast(&self, toast: Toast) {
        match toast.icon {
            ToastIcon::Success => info!(message = %toast.message, "toast"),
            ToastIcon::None => warn!(message = %toast.message, "toast"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate_to(&self, route: &str) {
        info!(route, "navigation requested");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOverlay;

impl LoadingOverlay for LogOverlay {
    fn show(&self, title: &str) -> Result<(), OverlayError> {
        info!(title, "loading overlay shown");
        Ok(())
    }

    fn hide(&self) -> Result<(), OverlayError> {
        info!("loading overlay hidden");
        Ok(())
    }
}

/// Saves downloads as files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStorage for DirectoryStorage {
    fn save(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(file_name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}
