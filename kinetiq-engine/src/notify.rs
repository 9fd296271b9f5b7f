use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{
    fmt::Display,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

/// Placeholder replaced by the detected value in URL templates
pub const VALUE_PLACEHOLDER: &str = "{value}";

/// Fire-and-forget delivery of detection events
pub trait Notifier: Send + Sync {
    fn notify(&self, url: String);
}

/// Issues a GET request for every notification, failures are only logged
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
}

impl HttpNotifier {
    /// Must be created from within the runtime that will carry the requests
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    fn send(&self, url: String) -> JoinHandle<()> {
        let client = self.client.clone();
        self.runtime.spawn(async move {
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(%url, "notification delivered");
                }
                Ok(response) => {
                    tracing::warn!(%url, status = %response.status(), "notification rejected");
                }
                Err(err) => {
                    tracing::warn!(%url, %err, "notification failed");
                }
            }
        })
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, url: String) {
        self.send(url);
    }
}

/// Lets an event through at most once per interval. The first event always passes.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_fire: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fire: None,
        }
    }

    pub fn try_fire(&mut self, now: Instant) -> bool {
        match self.last_fire {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_fire = Some(now);
                true
            }
        }
    }
}

/// Everything but unreserved characters is escaped
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Substitute the percent-encoded value into a URL template
pub fn render_url(template: &str, value: impl Display) -> String {
    let value = value.to_string();
    template.replace(
        VALUE_PLACEHOLDER,
        &utf8_percent_encode(&value, COMPONENT).to_string(),
    )
}
