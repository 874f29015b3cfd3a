use super::{HttpTracker, Tracker, TrackerRequest, TrackerResponse, UdpTracker};
use crate::error::{BittorrentError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

/// Announces to a torrent's tracker list, failing over in order
pub struct TrackerClient {
    client: Client,
    udp_connect_timeout: Duration,
    udp_announce_timeout: Duration,
}

impl TrackerClient {
    /// `http_timeout` bounds a whole HTTP announce, connect through body
    pub fn with_timeouts(
        http_timeout: Duration,
        udp_connect_timeout: Duration,
        udp_announce_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            client,
            udp_connect_timeout,
            udp_announce_timeout,
        })
    }

    /// Pick the transport for `url` by scheme
    pub fn tracker_for(&self, url: &str) -> Result<Tracker> {
        let scheme = url.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("udp") => Ok(Tracker::Udp(UdpTracker::new(
                url,
                self.udp_connect_timeout,
                self.udp_announce_timeout,
            ))),
            Some("http") | Some("https") => {
                Ok(Tracker::Http(HttpTracker::new(self.client.clone(), url)))
            }
            _ => Err(BittorrentError::UrlParseError(format!(
                "Unsupported tracker URL: {}",
                url
            ))),
        }
    }

    /// Try each URL once, in order, returning the first successful response
    pub async fn announce(&self, urls: &[String], request: &TrackerRequest) -> Result<TrackerResponse> {
        for url in urls {
            info!("Announcing to tracker: {}", url);

            let outcome = match self.tracker_for(url) {
                Ok(tracker) => tracker.announce(request).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => warn!("Tracker {} failed: {}", url, e),
            }
        }

        Err(BittorrentError::TrackerUnreachable {
            attempted: urls.len(),
        })
    }
}
