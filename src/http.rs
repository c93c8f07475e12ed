//! Shared HTTP client.
//!
//! One pooled client for every outbound request (search, webhooks).
//! Provider calls build their own client with a longer timeout.

use once_cell::sync::Lazy;
use std::time::Duration;

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
});

pub fn shared_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}
