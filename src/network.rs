//! Network State Monitor
//!
//! Holds the process-wide connectivity belief. Host "online" signals are not
//! trusted on their own: a cheap HEAD probe must succeed before the belief
//! flips to `true` and subscribers are told the collector is reachable again.
//! "Offline" signals flip the belief immediately.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the back-online broadcast channel.
const NOTIFY_CAPACITY: usize = 16;

/// Active reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns true when the network path to the collector is usable.
    async fn probe(&self) -> bool;
}

/// Probes reachability with a `HEAD` request to a cheap resource.
///
/// Any HTTP response counts as reachable, whatever its status; only a
/// connection-level error counts as unreachable.
pub struct HttpProber {
    http: reqwest::Client,
    url: String,
}

impl HttpProber {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> bool {
        match self
            .http
            .head(&self.url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
        {
            Ok(resp) => {
                debug!(url = %self.url, status = %resp.status(), "Probe answered");
                true
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Connectivity belief plus "back online" notifications.
pub struct NetworkMonitor {
    online: AtomicBool,
    prober: Box<dyn Prober>,
    notify: broadcast::Sender<()>,
}

impl NetworkMonitor {
    pub fn new(prober: Box<dyn Prober>, assume_online: bool) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            online: AtomicBool::new(assume_online),
            prober,
            notify,
        }
    }

    /// Current belief.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register for "became reachable" notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Host reported connectivity loss. No verification needed.
    pub fn on_connectivity_lost(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            info!("Connectivity lost, records will be persisted until recovery");
        }
    }

    /// Host reported connectivity restored.
    ///
    /// Flips the belief and notifies subscribers only if the probe succeeds.
    /// A failed probe leaves the belief untouched and schedules nothing.
    pub async fn on_connectivity_restored(&self) -> bool {
        if !self.prober.probe().await {
            warn!("Host reported online but probe failed, keeping current belief");
            return false;
        }
        self.online.store(true, Ordering::SeqCst);
        info!("Connectivity verified, back online");
        self.announce();
        true
    }

    /// Re-probe after a network-layer delivery failure.
    ///
    /// The belief becomes whatever the probe says. A false-to-true transition
    /// notifies subscribers the same way a verified host signal does.
    pub async fn reverify(&self) -> bool {
        let reachable = self.prober.probe().await;
        let was_online = self.online.swap(reachable, Ordering::SeqCst);
        match (was_online, reachable) {
            (true, false) => warn!("Probe after network failure failed, marking offline"),
            (false, true) => {
                info!("Probe succeeded, recovered without host signal");
                self.announce();
            }
            _ => debug!(reachable, "Reverify left belief unchanged"),
        }
        reachable
    }

    fn announce(&self) {
        // No subscribers is fine.
        let _ = self.notify.send(());
    }
}
