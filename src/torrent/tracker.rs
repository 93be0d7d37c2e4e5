//! HTTP tracker client: announces to the tracker(s) named in a torrent's
//! metainfo and parses the peer list back out of the bencoded response.
//!
//! Supports BEP-12 `announce-list` tiers: trackers within a tier are tried in
//! order on failure, and a tracker that answers successfully is promoted to
//! the front of its tier for the next announce.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bencode::{self, BValue, MalformedBencode};

/// Sent as the `event` query parameter on state-transition announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    /// No `event` parameter at all, for periodic re-announces.
    None,
}

impl Event {
    fn as_param(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),
    #[error("tracker rejected announce: {0}")]
    TrackerRejected(String),
    #[error("malformed tracker response: {0}")]
    Bencode(#[from] MalformedBencode),
    #[error("malformed tracker response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: std::net::IpAddr,
    pub port: u16,
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A successful announce's parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub peers: Vec<PeerAddr>,
}

pub struct AnnounceRequest<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// Fallback retry delay suggested to callers when a tracker is unreachable
/// and the response carried no `interval`. Callers should double this on
/// successive failures, capped at the tracker's last-known interval.
pub const BACKOFF_BASE: Duration = Duration::from_secs(30);

pub struct TrackerClient {
    http: reqwest::Client,
    /// BEP-12 tiers; mutated in place so a responding tracker moves to the
    /// front of its tier ahead of the next announce.
    tiers: Vec<Vec<String>>,
}

impl TrackerClient {
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("static reqwest client config is valid"),
            tiers,
        }
    }

    /// Announces to the first tracker willing to answer, walking tiers in
    /// order and retrying within a tier before advancing to the next one, per
    /// BEP-12. Returns the first success; fails only if every tracker in
    /// every tier is unreachable or rejects the request.
    pub async fn announce(&mut self, req: &AnnounceRequest<'_>) -> Result<AnnounceResponse, TrackerError> {
        let mut last_err = None;
        for tier_idx in 0..self.tiers.len() {
            let tier_len = self.tiers[tier_idx].len();
            for pos in 0..tier_len {
                let url = self.tiers[tier_idx][pos].clone();
                match self.announce_one(&url, req).await {
                    Ok(response) => {
                        if pos != 0 {
                            let winner = self.tiers[tier_idx].remove(pos);
                            self.tiers[tier_idx].insert(0, winner);
                        }
                        return Ok(response);
                    }
                    Err(err) => {
                        warn!(url, error = %err, "tracker announce failed");
                        last_err = Some(err);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TrackerError::TrackerUnavailable("no trackers configured".into())))
    }

    async fn announce_one(&self, url: &str, req: &AnnounceRequest<'_>) -> Result<AnnounceResponse, TrackerError> {
        let query = build_query(req);
        debug!(url, "announcing to tracker");
        let response = self
            .http
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| TrackerError::TrackerUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrackerError::TrackerUnavailable(format!(
                "http status {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TrackerError::TrackerUnavailable(e.to_string()))?;

        parse_response(&body)
    }
}

/// Builds the announce query parameters. `info_hash` and `peer_id` are raw 20
/// bytes; tracker HTTP servers expect them percent-encoded with every byte
/// escaped (not just the non-ASCII ones), so we hand-encode rather than rely
/// on a query serializer that assumes UTF-8 strings.
fn build_query(req: &AnnounceRequest<'_>) -> Vec<(String, String)> {
    let mut params = vec![
        ("info_hash".to_string(), percent_encode_bytes(req.info_hash)),
        ("peer_id".to_string(), percent_encode_bytes(req.peer_id)),
        ("port".to_string(), req.port.to_string()),
        ("uploaded".to_string(), req.uploaded.to_string()),
        ("downloaded".to_string(), req.downloaded.to_string()),
        ("left".to_string(), req.left.to_string()),
        ("compact".to_string(), "1".to_string()),
    ];
    if let Some(event) = req.event.as_param() {
        params.push(("event".to_string(), event.to_string()));
    }
    params
}

/// Percent-encodes every byte (reqwest's `query()` would otherwise treat the
/// value as UTF-8 and mangle non-UTF-8 hash bytes).
fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        out.push('%');
        out.push_str(&format!("{:02X}", b));
    }
    out
}

fn parse_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(body)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("top-level value is not a dictionary".into()))?;

    if let Some(reason) = dict.get(&b"failure reason"[..]).and_then(|v| v.as_str()) {
        return Err(TrackerError::TrackerRejected(reason.to_string()));
    }

    let interval = dict
        .get(&b"interval"[..])
        .and_then(|v| v.as_int())
        .ok_or_else(|| TrackerError::InvalidResponse("missing `interval`".into()))? as u64;

    let peers_value = dict
        .get(&b"peers"[..])
        .ok_or_else(|| TrackerError::InvalidResponse("missing `peers`".into()))?;
    let peers = parse_peers(peers_value)?;

    Ok(AnnounceResponse { interval, peers })
}

fn parse_peers(value: &BValue) -> Result<Vec<PeerAddr>, TrackerError> {
    match value {
        BValue::Bytes(bytes) => parse_compact_peers(bytes),
        BValue::List(entries) => entries.iter().map(parse_dict_peer).collect(),
        _ => Err(TrackerError::InvalidResponse(
            "`peers` is neither a compact bytestring nor a list".into(),
        )),
    }
}

fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<PeerAddr>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(
            "compact peers field length is not a multiple of 6".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

fn parse_dict_peer(value: &BValue) -> Result<PeerAddr, TrackerError> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("peer entry is not a dictionary".into()))?;
    let ip_str = dict
        .get(&b"ip"[..])
        .and_then(|v| v.as_str())
        .ok_or_else(|| TrackerError::InvalidResponse("peer entry missing `ip`".into()))?;
    let ip = ip_str
        .parse()
        .map_err(|_| TrackerError::InvalidResponse(format!("peer entry has unparseable ip `{ip_str}`")))?;
    let port = dict
        .get(&b"port"[..])
        .and_then(|v| v.as_int())
        .ok_or_else(|| TrackerError::InvalidResponse("peer entry missing `port`".into()))? as u16;
    Ok(PeerAddr { ip, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(
            response.peers,
            vec![
                PeerAddr {
                    ip: std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
                    port: 0x1AE1,
                },
                PeerAddr {
                    ip: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2)),
                    port: 0x1AE2,
                },
            ]
        );
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = parse_response(body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason17:torrent not founde";
        let err = parse_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::TrackerRejected(_)));
    }

    #[test]
    fn rejects_malformed_compact_length() {
        let body = b"d8:intervali60e5:peers5:abcdee";
        assert!(parse_response(body).is_err());
    }

    #[test]
    fn percent_encodes_every_byte() {
        let hash = [0u8; 20];
        let encoded = percent_encode_bytes(&hash);
        assert_eq!(encoded, "%00".repeat(20));
    }
}
