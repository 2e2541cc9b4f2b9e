use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use time::OffsetDateTime;

// ============================================================================
// Node Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wireless {
    #[serde(default)]
    pub channel24: u32,
    #[serde(default)]
    pub channel5: u32,
    #[serde(default, rename = "txpower24")]
    pub tx_power24: u32,
    #[serde(default, rename = "txpower5")]
    pub tx_power5: u32,
}

/// Airtime counters of one radio as reported by the node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirelessAirtime {
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub chan_util: f32,
    #[serde(default)]
    pub rx_util: f32,
    #[serde(default)]
    pub tx_util: f32,
    #[serde(default)]
    pub noise: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clients {
    #[serde(default)]
    pub wifi: u32,
    #[serde(default)]
    pub wifi24: u32,
    #[serde(default)]
    pub wifi5: u32,
    #[serde(default)]
    pub total: u32,
}

/// Volatile telemetry, refreshed on every sighting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    #[serde(default)]
    pub wireless: Vec<WirelessAirtime>,
    #[serde(default)]
    pub clients: Clients,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    #[serde(default, rename = "owner")]
    pub owner_contact: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default, rename = "wireless")]
    pub wireless_config: Wireless,
    #[serde(default, rename = "statistics")]
    pub stats: NodeStats,
    #[serde(rename = "lastseen", with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Node {
    /// Compares the configuration-relevant fields only; `stats` and
    /// `last_seen` never make two snapshots differ.
    pub fn same_config(&self, other: &Node) -> bool {
        self.node_id == other.node_id
            && self.address == other.address
            && self.hostname == other.hostname
            && self.owner_contact == other.owner_contact
            && self.location == other.location
            && self.wireless_config == other.wireless_config
    }

    /// Adopt `candidate` if nothing is known yet or it is globally routable.
    pub fn merge_address(&mut self, candidate: Option<IpAddr>) {
        if let Some(ip) = candidate {
            if self.address.is_none() || is_global_unicast(&ip) {
                self.address = Some(ip);
            }
        }
    }

    /// Copy the operator-editable fields of `desired` onto this record.
    pub fn apply_config(&mut self, desired: &Node) {
        self.hostname = desired.hostname.clone();
        self.owner_contact = desired.owner_contact.clone();
        self.location = desired.location;
        self.wireless_config = desired.wireless_config;
    }
}

/// Unicast address that is neither unspecified, loopback, link-local nor
/// broadcast. Private ranges count as global, matching how mesh nodes
/// advertise their ULA management addresses.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

// ============================================================================
// Global Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    #[serde(default)]
    pub nodes: u32,
    #[serde(default)]
    pub gateways: u32,
    #[serde(default)]
    pub clients: u32,
    #[serde(default)]
    pub clients_wifi: u32,
    #[serde(default)]
    pub clients_wifi24: u32,
    #[serde(default)]
    pub clients_wifi5: u32,
    #[serde(default)]
    pub firmwares: BTreeMap<String, u32>,
    #[serde(default)]
    pub models: BTreeMap<String, u32>,
}

// ============================================================================
// HTTP Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: BTreeMap<String, Node>,
    pub current: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SightingRequest {
    pub nodeinfo: Option<serde_json::Value>,
    pub statistics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalStatsRequest {
    pub statistics: GlobalStats,
    pub site: String,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[cfg(test)]
pub fn test_node(id: &str) -> Node {
    Node {
        node_id: id.to_string(),
        hostname: format!("node-{}", id),
        address: Some("2001:db8::1".parse().unwrap()),
        owner_contact: "ops@example.org".to_string(),
        location: Location {
            latitude: 53.07,
            longitude: 8.8,
            altitude: 0.0,
        },
        wireless_config: Wireless {
            channel24: 1,
            channel5: 44,
            tx_power24: 10,
            tx_power5: 17,
        },
        stats: NodeStats::default(),
        last_seen: OffsetDateTime::now_utc(),
    }
}
