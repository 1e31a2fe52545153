//! The shared uplink message type relayed from the broker to subscribers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded location-telemetry uplink.
///
/// The hub only inspects the four filter attributes. Everything else the
/// broker sends (coordinates, gateway metadata, signal quality, ...) rides
/// along opaquely in `payload` and is re-emitted verbatim to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkMessage {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub dev_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub experiment: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_fields_survive_relay() {
        let raw = json!({
            "app_id": "mapper",
            "dev_id": "dev1",
            "experiment": "rooftop",
            "latitude": 52.372,
            "longitude": 4.893,
            "gateways": [{"gtw_id": "eui-1", "rssi": -113}],
        });

        let message: UplinkMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.app_id, "mapper");
        assert_eq!(message.dev_id, "dev1");
        assert_eq!(message.user_id, "");
        assert_eq!(message.experiment, "rooftop");

        let out: Value = serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(out["latitude"], raw["latitude"]);
        assert_eq!(out["gateways"], raw["gateways"]);
    }
}
