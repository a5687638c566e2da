use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::channel::Channel;

/// Public chatters endpoint. `{channel}` is replaced by the channel name without `#`.
pub const DEFAULT_CHATTERS_URL: &str = "https://tmi.twitch.tv/group/user/{channel}/chatters";

/// Placeholder substituted in a chatters URL template.
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chatter list of one channel at one point in time, grouped by category
/// (broadcaster, moderators, vips, viewers, ...). Usernames are lower-case and
/// sorted within each category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatterSnapshot {
    pub chatter_count: u64,
    pub categories: BTreeMap<String, Vec<String>>,
    pub taken_at: DateTime<Utc>,
}

impl ChatterSnapshot {
    /// Build a snapshot, normalizing usernames and sorting each category.
    pub fn from_categories<I>(categories: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let categories: BTreeMap<String, Vec<String>> = categories
            .into_iter()
            .map(|(category, mut names)| {
                for name in names.iter_mut() {
                    *name = name.to_lowercase();
                }
                names.sort();
                names.dedup();
                (category, names)
            })
            .collect();
        let chatter_count = categories.values().map(|n| n.len() as u64).sum();
        Self {
            chatter_count,
            categories,
            taken_at: Utc::now(),
        }
    }

    /// Usernames in `category`, empty when the category is absent.
    pub fn category(&self, category: &str) -> &[String] {
        self.categories.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, username: &str) -> bool {
        let username = username.to_lowercase();
        self.categories
            .values()
            .any(|names| names.binary_search(&username).is_ok())
    }
}

/// Source of chatter snapshots. Errors are recoverable; the watcher logs them
/// and tries again on a later tick.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, channel: &Channel) -> Result<ChatterSnapshot>;
}

/// Response body of the chatters endpoint.
#[derive(Deserialize)]
struct ChattersResponse {
    #[serde(default)]
    chatter_count: Option<u64>,
    chatters: BTreeMap<String, Vec<String>>,
}

/// Fetches snapshots from an HTTP endpoint returning `{"chatters": {category: [names]}}`.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpSnapshotSource {
    pub fn new(url_template: impl Into<String>) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains(CHANNEL_PLACEHOLDER) {
            return Err(anyhow!("chatters url has no {CHANNEL_PLACEHOLDER} placeholder"));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url_template,
        })
    }

    pub fn url_for(&self, channel: &Channel) -> String {
        self.url_template
            .replace(CHANNEL_PLACEHOLDER, channel.name_without_sigil())
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, channel: &Channel) -> Result<ChatterSnapshot> {
        let url = self.url_for(channel);
        let body = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("chatters request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("chatters endpoint returned an error: {url}"))?
            .json::<ChattersResponse>()
            .await
            .with_context(|| format!("invalid chatters response: {url}"))?;

        let mut snapshot = ChatterSnapshot::from_categories(body.chatters);
        if let Some(count) = body.chatter_count {
            snapshot.chatter_count = count;
        }
        Ok(snapshot)
    }
}
