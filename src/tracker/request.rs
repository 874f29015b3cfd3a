/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// Event field of a UDP announce
    pub fn udp_id(event: Option<TrackerEvent>) -> u32 {
        match event {
            None => 0,
            Some(TrackerEvent::Completed) => 1,
            Some(TrackerEvent::Started) => 2,
            Some(TrackerEvent::Stopped) => 3,
        }
    }
}

/// Parameters of one announce, shared by HTTP and UDP trackers
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port our peer server listens on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing
    pub left: u64,
    pub event: Option<TrackerEvent>,
}

impl TrackerRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: Some(TrackerEvent::Started),
        }
    }

    pub fn with_event(mut self, event: Option<TrackerEvent>) -> Self {
        self.event = event;
        self
    }

    /// Query string for an HTTP announce. The binary hash and id are
    /// escaped byte-for-byte, never interpreted as text.
    pub fn to_query_string(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash),
            percent_encode(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );

        if let Some(event) = &self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        query
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_escapes_every_byte() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xff;
        info_hash[1] = b'a';
        let request = TrackerRequest::new(info_hash, *b"-PP0001-123456789012", 6881, 24384);
        let query = request.to_query_string();

        assert!(query.starts_with("info_hash=%FF%61%00"));
        assert!(query.contains("&peer_id=%2D%50%50%30"));
        assert!(query.contains("&port=6881&uploaded=0&downloaded=0&left=24384"));
        assert!(query.ends_with("&event=started"));

        let query = request.with_event(None).to_query_string();
        assert!(query.ends_with("compact=1"));
    }
}
