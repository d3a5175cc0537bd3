//! Network reachability tracking.
//!
//! [`NetworkMonitor`] holds the latest [`NetworkStatus`]; whatever platform
//! primitive observes path changes feeds it through
//! [`update`](NetworkMonitor::update). On desktop, [`InterfacePoller`] plays
//! that role by polling local interfaces. The monitor only reports; it
//! never initiates a reconnect.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Kind of interface carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    None,
}

/// Reachability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub reachable: bool,
    pub interface: InterfaceType,
}

impl NetworkStatus {
    pub const OFFLINE: Self = Self {
        reachable: false,
        interface: InterfaceType::None,
    };

    pub fn online(interface: InterfaceType) -> Self {
        Self {
            reachable: true,
            interface,
        }
    }
}

type ChangeCallback = Box<dyn Fn(&NetworkStatus) + Send + Sync>;

/// Current reachability plus change notification.
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        Self {
            tx: watch::Sender::new(initial),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Records a new status. Callbacks and watchers only hear about actual
    /// transitions; returns `true` if this was one.
    pub fn update(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(reachable = status.reachable, interface = ?status.interface, "network status changed");
            let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            for cb in callbacks.iter() {
                cb(&status);
            }
        }
        changed
    }

    /// Registers a callback invoked on every transition.
    pub fn on_change(&self, cb: impl Fn(&NetworkStatus) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(cb));
    }

    /// Returns a receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    /// Starts optimistic: reachable over an unknown interface.
    fn default() -> Self {
        Self::new(NetworkStatus::online(InterfaceType::Other))
    }
}

/// Desktop path-change primitive: polls local interfaces with `if-addrs`.
pub struct InterfacePoller {
    monitor: Arc<NetworkMonitor>,
    period: Duration,
}

impl InterfacePoller {
    pub fn new(monitor: Arc<NetworkMonitor>, period: Duration) -> Self {
        Self { monitor, period }
    }

    /// Reads interfaces once and feeds the monitor.
    pub fn poll_once(&self) -> NetworkStatus {
        let names: Vec<String> = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .filter(|iface| !is_link_local(iface.ip()))
                .map(|iface| iface.name)
                .collect(),
            Err(e) => {
                debug!("failed to list interfaces: {e}");
                Vec::new()
            }
        };
        let status = status_from_interfaces(&names);
        self.monitor.update(status);
        status
    }

    /// Polls until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once();
                    }
                }
            }
        })
    }
}

fn is_link_local(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_link_local(),
        std::net::IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Classifies an interface by its OS name.
pub fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_ascii_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| name.starts_with(p));
    if starts(&["wl", "wifi", "ath"]) {
        InterfaceType::Wifi
    } else if starts(&["rmnet", "wwan", "ccmni", "pdp_ip", "usb"]) {
        InterfaceType::Cellular
    } else if starts(&["eth", "en", "em", "ethernet"]) {
        InterfaceType::Ethernet
    } else {
        InterfaceType::Other
    }
}

/// Derives a status from the names of the usable interfaces.
///
/// Prefers ethernet, then wifi, then cellular.
pub fn status_from_interfaces(names: &[String]) -> NetworkStatus {
    const PREFERENCE: [InterfaceType; 4] = [
        InterfaceType::Ethernet,
        InterfaceType::Wifi,
        InterfaceType::Cellular,
        InterfaceType::Other,
    ];
    let kinds: Vec<InterfaceType> = names.iter().map(|n| classify_interface(n)).collect();
    PREFERENCE
        .into_iter()
        .find(|kind| kinds.contains(kind))
        .map_or(NetworkStatus::OFFLINE, NetworkStatus::online)
}
