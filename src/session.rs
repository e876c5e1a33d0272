//! One tagging session: the components wired to a shared config store.

use crate::autocomplete::{AutocompleteClient, TagSuggestion};
use crate::client::{RequestObserver, TaggerClient};
use crate::config::{Config, ConfigStore};
use crate::connection::ConnectionTracker;
use crate::error::{Error, Result};
use crate::fetcher::ImageFetcher;
use crate::tags::{self, PageKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Holds the busy flag for the duration of one generation
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Session {
    store: ConfigStore,
    client: TaggerClient,
    images: ImageFetcher,
    autocomplete: AutocompleteClient,
    busy: AtomicBool,
}

impl Session {
    pub fn new(store: ConfigStore) -> Self {
        let tracker = Arc::new(ConnectionTracker::default());
        Self {
            store,
            client: TaggerClient::new(tracker),
            images: ImageFetcher::new(),
            autocomplete: AutocompleteClient::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.client = self.client.with_observer(observer);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.client = self.client.with_retry_delay(delay);
        self
    }

    pub fn with_autocomplete(mut self, autocomplete: AutocompleteClient) -> Self {
        self.autocomplete = autocomplete;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn config(&self) -> Config {
        self.store.snapshot()
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        self.client.tracker()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Tag the image at `image_url` and return the new field text.
    ///
    /// Only one generation runs at a time; a second call while one is in
    /// flight fails with [`Error::Busy`]. A failed prediction triggers a probe
    /// so the connection status catches up before the error is returned.
    pub async fn generate(&self, image_url: &str, field: &str) -> Result<String> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let config = self.store.snapshot();

        let image = self.images.fetch_data_url(image_url, &config).await?;

        match self.client.predict(&image, &config).await {
            Ok(prediction) => {
                let tags = tags::format_tags(&prediction.tags, field, &config);
                info!(attempts = prediction.attempts, "Tags generated");
                Ok(tags)
            }
            Err(e) => {
                debug!(error = %e, "Prediction failed, probing endpoint");
                self.client.probe(&config).await;
                Err(e)
            }
        }
    }

    /// The "Sort" action on the tag field
    pub fn reformat(&self, field: &str) -> String {
        tags::reformat(field, &self.store.snapshot())
    }

    pub fn constant_tags(&self, field: &str, page: PageKind) -> Option<String> {
        tags::constant_tags(field, &self.store.snapshot(), page)
    }

    pub fn update_confidence(&self, value: f64) -> Result<f64> {
        self.store.update_confidence(value)
    }

    pub async fn suggest(&self, term: &str) -> Vec<TagSuggestion> {
        self.autocomplete.suggest(term).await
    }

    pub async fn probe(&self) -> bool {
        self.client.probe(&self.store.snapshot()).await
    }

    /// Test an endpoint typed into the settings form before it is saved
    pub async fn check_endpoint(&self, endpoint: &str) -> Result<()> {
        self.client.check_endpoint(endpoint, &self.store.snapshot()).await
    }

    /// Probe the endpoint now and then every `interval` until the handle is aborted
    pub fn spawn_probe_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let connected = self.probe().await;
                debug!(connected, "Periodic probe");
            }
        })
    }
}
