use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use time::OffsetDateTime;
use tracing::debug;

use crate::types::{Clients, Location, Node, NodeStats, Wireless, WirelessAirtime};

// ============================================================================
// Collector Payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RawNodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub network: RawNetwork,
    pub owner: Option<RawOwner>,
    pub location: Option<Location>,
    pub wireless: Option<Wireless>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNetwork {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOwner {
    #[serde(default)]
    pub contact: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStatistics {
    pub clients: Option<Clients>,
    pub wireless: Option<Vec<WirelessAirtime>>,
}

impl RawNodeInfo {
    /// Pick the management address: the first parseable one, replaced by any
    /// globally routable one that follows.
    pub fn management_address(&self) -> Option<IpAddr> {
        let mut address: Option<IpAddr> = None;
        for raw in &self.network.addresses {
            let Ok(ip) = raw.parse::<IpAddr>() else {
                continue;
            };
            if address.is_none() || crate::types::is_global_unicast(&ip) {
                address = Some(ip);
            }
        }
        address
    }
}

/// Build a candidate node from one sighting. `None` when the nodeinfo part is
/// absent or cannot be parsed; unusable statistics only leave stats empty.
pub fn candidate_node(nodeinfo: Option<Value>, statistics: Option<Value>) -> Option<Node> {
    let nodeinfo = nodeinfo?;
    let info: RawNodeInfo = match serde_json::from_value(nodeinfo) {
        Ok(info) => info,
        Err(e) => {
            debug!("Skipping sighting with unparseable nodeinfo: {}", e);
            return None;
        }
    };

    if info.node_id.is_empty() {
        debug!("Skipping sighting without node_id");
        return None;
    }

    let stats = match statistics.map(serde_json::from_value::<RawStatistics>) {
        Some(Ok(raw)) => NodeStats {
            wireless: raw.wireless.unwrap_or_default(),
            clients: raw.clients.unwrap_or_default(),
        },
        Some(Err(e)) => {
            debug!(node_id = %info.node_id, "Ignoring unparseable statistics: {}", e);
            NodeStats::default()
        }
        None => NodeStats::default(),
    };

    let address = info.management_address();

    Some(Node {
        node_id: info.node_id,
        hostname: info.hostname,
        address,
        owner_contact: info.owner.map(|o| o.contact).unwrap_or_default(),
        location: info.location.unwrap_or_default(),
        wireless_config: info.wireless.unwrap_or_default(),
        stats,
        last_seen: OffsetDateTime::now_utc(),
    })
}
