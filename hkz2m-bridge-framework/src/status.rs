//! Upstream bridge availability.

use serde::{Deserialize, Serialize};

/// Availability reported by Zigbee2MQTT on `bridge/state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    /// The bridge announced itself online.
    Online,
    /// Anything else, including no announcement yet.
    #[default]
    Offline,
}

#[derive(Deserialize)]
struct StatePayload {
    state: String,
}

impl BridgeStatus {
    /// Interpret a `bridge/state` payload.
    ///
    /// Accepts both the legacy plain string (`online`) and the JSON form
    /// (`{"state":"online"}`). Every other payload means offline.
    pub fn from_payload(payload: &[u8]) -> Self {
        let state = match serde_json::from_slice::<StatePayload>(payload) {
            Ok(json) => json.state.into_bytes(),
            Err(_) => payload.to_vec(),
        };

        if state == b"online" {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Whether the bridge is online.
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeStatus::Online => write!(f, "online"),
            BridgeStatus::Offline => write!(f, "offline"),
        }
    }
}
