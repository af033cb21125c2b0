use std::path::Path;
use std::time::Duration;

use nostr_sdk::prelude::RelayUrl;
use serde::Deserialize;

use super::AppCore;

const DEFAULT_RELAY_URLS: &[&str] = &["wss://relay.damus.io", "wss://relay.primal.net"];

// Relay-list documents (kind 10050/10002) are widely mirrored here even when
// the author's own relays are unknown to us.
const DISCOVERY_RELAY_URLS: &[&str] = &["wss://purplepag.es", "wss://relay.nostr.band"];

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(super) struct AppConfig {
    pub(super) relay_urls: Option<Vec<String>>,
    pub(super) discovery_relay_urls: Option<Vec<String>>,
    pub(super) page_size: Option<usize>,
    pub(super) query_timeout_secs: Option<u64>,
}

pub(super) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join("veil_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    serde_json::from_slice::<AppConfig>(&bytes).unwrap_or_default()
}

fn parse_urls(urls: &[String]) -> Vec<RelayUrl> {
    urls.iter().filter_map(|u| RelayUrl::parse(u).ok()).collect()
}

impl AppCore {
    /// The account's general relay set.
    pub(super) fn default_relays(&self) -> Vec<RelayUrl> {
        if let Some(urls) = &self.config.relay_urls {
            let parsed = parse_urls(urls);
            if !parsed.is_empty() {
                return parsed;
            }
        }
        DEFAULT_RELAY_URLS
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .collect()
    }

    /// Fallback discovery set, used for relay-list lookups and unioned into
    /// every sync query.
    pub(super) fn discovery_relays(&self) -> Vec<RelayUrl> {
        if let Some(urls) = &self.config.discovery_relay_urls {
            let parsed = parse_urls(urls);
            if !parsed.is_empty() {
                return parsed;
            }
        }
        DISCOVERY_RELAY_URLS
            .iter()
            .filter_map(|u| RelayUrl::parse(u).ok())
            .collect()
    }

    pub(super) fn page_size(&self) -> usize {
        self.config
            .page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub(super) fn query_timeout(&self) -> Duration {
        Duration::from_secs(
            self.config
                .query_timeout_secs
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS),
        )
    }
}
