//! ICE server selection and TURN credential issuance.
//!
//! Servers reported by the community are ranked by reputation, freshness and
//! latency. When none qualify the public STUN fallback list is used.

use std::sync::RwLock;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use cairn_shared::types::WalletAddress;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_REPUTATION: f64 = 0.7;
pub const MAX_SERVER_AGE_HOURS: i64 = 24;
pub const MAX_SELECTED: usize = 3;
pub const TURN_CREDENTIAL_TTL_SECS: i64 = 600;

pub const FALLBACK_STUN: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// A server advertised by another peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityIceServer {
    pub url: String,
    pub kind: IceServerKind,
    /// Shared secret the TURN server validates credentials against
    pub public_key: Vec<u8>,
    /// 0.0 ..= 1.0
    pub reputation: f64,
    pub latency_ms: u32,
    pub last_seen: DateTime<Utc>,
}

/// What a peer connection is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Short-lived TURN credentials for one server.
///
/// `username = "<expiry unix>:<wallet>"`,
/// `credential = base64(HMAC-SHA256(server key, username))`.
pub fn turn_credentials(
    server_key: &[u8],
    wallet: &WalletAddress,
    now: DateTime<Utc>,
) -> Option<(String, String)> {
    let expiry = (now + Duration::seconds(TURN_CREDENTIAL_TTL_SECS)).timestamp();
    let username = format!("{expiry}:{wallet}");

    let mut mac = HmacSha256::new_from_slice(server_key).ok()?;
    mac.update(username.as_bytes());
    let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Some((username, credential))
}

#[derive(Default)]
pub struct IceServerRegistry {
    servers: RwLock<Vec<CommunityIceServer>>,
}

impl IceServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a reported server (keyed by URL).
    pub fn report(&self, server: CommunityIceServer) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        match servers.iter_mut().find(|s| s.url == server.url) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Servers for a connection made by `wallet`. TURN entries get fresh
    /// credentials computed against their own key.
    pub fn select(&self, wallet: &WalletAddress, now: DateTime<Utc>) -> Vec<IceServer> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - Duration::hours(MAX_SERVER_AGE_HOURS);

        let mut eligible: Vec<&CommunityIceServer> = servers
            .iter()
            .filter(|s| s.reputation > MIN_REPUTATION && s.last_seen >= cutoff)
            .collect();
        eligible.sort_by(|a, b| {
            a.latency_ms
                .cmp(&b.latency_ms)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });

        let selected: Vec<IceServer> = eligible
            .into_iter()
            .take(MAX_SELECTED)
            .filter_map(|s| match s.kind {
                IceServerKind::Stun => Some(IceServer::stun(&s.url)),
                IceServerKind::Turn => {
                    let (username, credential) = turn_credentials(&s.public_key, wallet, now)?;
                    Some(IceServer {
                        urls: vec![s.url.clone()],
                        username: Some(username),
                        credential: Some(credential),
                    })
                }
            })
            .collect();

        if selected.is_empty() {
            debug!("no community ICE servers qualify, using public STUN");
            return FALLBACK_STUN.iter().map(|u| IceServer::stun(u)).collect();
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x3333333333333333333333333333333333333333").unwrap()
    }

    fn server(url: &str, reputation: f64, latency_ms: u32, age_hours: i64) -> CommunityIceServer {
        CommunityIceServer {
            url: url.to_string(),
            kind: IceServerKind::Stun,
            public_key: vec![],
            reputation,
            latency_ms,
            last_seen: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_fallback_when_empty() {
        let registry = IceServerRegistry::new();
        let selected = registry.select(&wallet(), Utc::now());
        assert_eq!(selected.len(), FALLBACK_STUN.len());
        assert!(selected[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn test_filters_and_orders() {
        let registry = IceServerRegistry::new();
        registry.report(server("stun:slow", 0.9, 200, 1));
        registry.report(server("stun:fast", 0.9, 20, 1));
        registry.report(server("stun:bad-rep", 0.5, 1, 1));
        registry.report(server("stun:stale", 0.95, 5, 30));
        registry.report(server("stun:mid", 0.8, 80, 2));
        registry.report(server("stun:extra", 0.8, 300, 2));

        let urls: Vec<String> = registry
            .select(&wallet(), Utc::now())
            .into_iter()
            .map(|s| s.urls[0].clone())
            .collect();
        assert_eq!(urls, vec!["stun:fast", "stun:mid", "stun:slow"]);
    }

    #[test]
    fn test_report_replaces_same_url() {
        let registry = IceServerRegistry::new();
        registry.report(server("stun:a", 0.9, 10, 1));
        registry.report(server("stun:a", 0.1, 10, 1));
        assert_eq!(registry.len(), 1);
        // now below threshold -> fallback
        assert_eq!(registry.select(&wallet(), Utc::now()).len(), FALLBACK_STUN.len());
    }

    #[test]
    fn test_turn_credentials_per_server() {
        let now = Utc::now();
        let (user_a, cred_a) = turn_credentials(b"server-a", &wallet(), now).unwrap();
        let (user_b, cred_b) = turn_credentials(b"server-b", &wallet(), now).unwrap();

        assert_eq!(user_a, user_b);
        assert!(user_a.ends_with(wallet().as_str()));
        assert_ne!(cred_a, cred_b);

        let expiry: i64 = user_a.split(':').next().unwrap().parse().unwrap();
        assert_eq!(expiry, now.timestamp() + TURN_CREDENTIAL_TTL_SECS);
    }

    #[test]
    fn test_turn_entry_gets_credentials() {
        let registry = IceServerRegistry::new();
        let mut turn = server("turn:relay.example:3478", 0.9, 10, 0);
        turn.kind = IceServerKind::Turn;
        turn.public_key = b"k".to_vec();
        registry.report(turn);

        let selected = registry.select(&wallet(), Utc::now());
        assert_eq!(selected.len(), 1);
        assert!(selected[0].username.is_some());
        assert!(selected[0].credential.is_some());
    }
}
