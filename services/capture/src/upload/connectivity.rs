use std::sync::Arc;
use tokio::sync::watch;

/// Network reachability and foreground state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub online: bool,
    /// False while the app is backgrounded
    pub visible: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            online: true,
            visible: true,
        }
    }
}

/// Broadcasts connectivity and visibility changes to running uploads.
///
/// Platform glue calls [`set_online`](Self::set_online) and
/// [`set_visible`](Self::set_visible); every upload attempt holds its own
/// receiver and re-evaluates its watchdogs on each change.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::with_status(NetworkStatus::default())
    }

    pub fn with_status(status: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(status);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.online != online;
            status.online = online;
            changed
        });
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.visible != visible;
            status.visible = visible;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().online);

        monitor.set_visible(false);
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow_and_update(),
            NetworkStatus {
                online: false,
                visible: false
            }
        );
    }

    #[test]
    fn test_unchanged_status_does_not_notify() {
        let monitor = ConnectivityMonitor::new();
        let rx = monitor.subscribe();
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
