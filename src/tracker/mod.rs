//! Tracker announces over HTTP(S) and UDP.

mod client;
mod http;
mod peer;
mod request;
mod response;
mod udp;

pub use client::TrackerClient;
pub use http::HttpTracker;
pub use peer::Peer;
pub use request::{TrackerEvent, TrackerRequest};
pub use response::TrackerResponse;
pub use udp::UdpTracker;

use crate::error::Result;

/// One tracker endpoint, whatever its transport
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        match self {
            Tracker::Http(tracker) => tracker.announce(request).await,
            Tracker::Udp(tracker) => tracker.announce(request).await,
        }
    }
}
