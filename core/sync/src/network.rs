//! Connectivity monitoring.
//!
//! [`NetworkMonitor`] holds the latest connectivity signal and fans transitions
//! out to registered listeners. The platform feeds it either by calling
//! [`NetworkMonitor::report`] or by attaching a stream of readings with
//! [`NetworkMonitor::attach`]. Listeners fire only while the monitor is started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct Listener {
    on_online: Callback,
    on_offline: Callback,
}

type ListenerMap = RwLock<HashMap<u64, Listener>>;

/// Lifecycle-scoped connectivity service.
pub struct NetworkMonitor {
    status: watch::Sender<bool>,
    listeners: Arc<ListenerMap>,
    next_id: AtomicU64,
    running: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Create a monitor with the platform's current reading.
    pub fn new(initially_online: bool) -> Self {
        let (status, _) = watch::channel(initially_online);
        Self {
            status,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    /// Latest connectivity reading.
    pub fn is_online(&self) -> bool {
        *self.status.borrow()
    }

    /// Receiver that observes every reading change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    /// Register a pair of transition callbacks.
    ///
    /// The returned guard unregisters them when dropped.
    pub fn add_listener<On, Off>(&self, on_online: On, on_offline: Off) -> ListenerGuard
    where
        On: Fn() + Send + Sync + 'static,
        Off: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener = Listener {
            on_online: Arc::new(on_online),
            on_offline: Arc::new(on_offline),
        };
        write_listeners(&self.listeners).insert(id, listener);
        debug!("Registered network listener {}", id);

        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        read_listeners(&self.listeners).len()
    }

    /// Begin dispatching transitions to listeners.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Network monitor started (online: {})", self.is_online());
        }
    }

    /// Stop dispatching and detach any attached reading source.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Network monitor stopped");
        }
        if let Some(pump) = lock_pump(&self.pump).take() {
            pump.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feed a connectivity reading.
    ///
    /// Listeners run only when the reading differs from the previous one.
    /// Returns whether this was a transition.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
            if self.is_running() {
                self.dispatch(online);
            }
        }
        changed
    }

    /// Forward readings from a platform stream until it ends or the monitor stops.
    pub fn attach<S>(self: &Arc<Self>, readings: S)
    where
        S: Stream<Item = bool> + Send + 'static,
    {
        self.start();
        let monitor = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            futures::pin_mut!(readings);
            while let Some(online) = readings.next().await {
                match monitor.upgrade() {
                    Some(monitor) => {
                        monitor.report(online);
                    }
                    None => break,
                }
            }
            debug!("Connectivity source ended");
        });

        if let Some(previous) = lock_pump(&self.pump).replace(handle) {
            previous.abort();
        }
    }

    fn dispatch(&self, online: bool) {
        // Snapshot so callbacks may add or remove listeners.
        let listeners: Vec<Listener> = read_listeners(&self.listeners).values().cloned().collect();
        for listener in listeners {
            if online {
                (listener.on_online)();
            } else {
                (listener.on_offline)();
            }
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(pump) = lock_pump(&self.pump).take() {
            pump.abort();
        }
    }
}

/// Registration handle returned by [`NetworkMonitor::add_listener`].
#[must_use = "dropping the guard unregisters the listener"]
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl ListenerGuard {
    /// Unregister now.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            write_listeners(&listeners).remove(&self.id);
            debug!("Unregistered network listener {}", self.id);
        }
    }
}

fn read_listeners(map: &ListenerMap) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Listener>> {
    map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_listeners(map: &ListenerMap) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Listener>> {
    map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_pump(pump: &Mutex<Option<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
