//! Wire frames from the management plane. Parsed once at the read
//! boundary into a closed sum type with an `Unknown` catch-all so new
//! server-side event types don't break older gateways (Design Note).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionAck {
    #[serde(rename = "gatewayId")]
    pub gateway_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiDeployedPayload {
    #[serde(rename = "apiId")]
    pub api_id: String,
    pub environment: String,
    #[serde(rename = "revisionId")]
    pub revision_id: String,
    pub vhost: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiDeployed {
    pub payload: ApiDeployedPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "correlationId")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Frame {
    ConnectionAck(ConnectionAck),
    ApiDeployed(ApiDeployed),
    ApiUndeployed(ApiDeployed),
    Unknown { raw_type: String, raw: JsonValue },
}

impl Frame {
    /// Parses a text frame's JSON body. A missing or non-string `type`
    /// field is a parse failure; an unrecognized but well-formed `type`
    /// is an `Unknown` frame, not an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: JsonValue = serde_json::from_str(text)?;
        let frame_type = raw
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or("")
            .to_string();

        let frame = match frame_type.as_str() {
            "connection.ack" => {
                Frame::ConnectionAck(serde_json::from_value(raw.clone())?)
            }
            "api.deployed" => Frame::ApiDeployed(serde_json::from_value(raw.clone())?),
            "api.undeployed" => Frame::ApiUndeployed(serde_json::from_value(raw.clone())?),
            other => Frame::Unknown {
                raw_type: other.to_string(),
                raw,
            },
        };

        Ok(frame)
    }
}
