use super::{TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

/// Announce over HTTP(S): one GET, bencoded body
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }

    pub fn announce_url(&self, request: &TrackerRequest) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => {
                format!("{}&{}", existing, request.to_query_string())
            }
            _ => request.to_query_string(),
        };
        url.set_query(Some(&query));
        Ok(url)
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let url = self.announce_url(request)?;
        debug!("Tracker request URL: {}", url);

        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BittorrentError::TrackerError(format!(
                "HTTP error: {}",
                status
            )));
        }

        // The body may arrive in several chunks
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        debug!("Tracker response status: {}, body length: {}", status, body.len());

        let tracker_response = TrackerResponse::from_bencode(&decode(&body)?)?;
        info!(
            "Received {} peers from {} (interval: {}s)",
            tracker_response.peers.len(),
            self.url,
            tracker_response.interval
        );

        Ok(tracker_response)
    }
}
