//! Wraps the gateway's custom bundle types (`PolicyState`, `LazyResources`)
//! as `google.protobuf.Struct`-backed `Any` resources, since — unlike
//! `Listener`/`Route`/`Cluster` — they have no fixed Envoy protobuf schema
//! of their own.

use envoy_types::pb::google::protobuf::Any;
use prost_types::value::Kind;
use prost_types::{ListValue, Struct as ProstStruct, Value as ProstValue};
use serde_json::Value as JsonValue;

use gwcp_xds::BuiltResource;

pub const POLICY_STATE_TYPE_URL: &str = "type.googleapis.com/api-platform.wso2.org/v1.PolicyState";
pub const LAZY_RESOURCES_TYPE_URL: &str = "type.googleapis.com/api-platform.wso2.org/v1.LazyResources";

fn json_to_prost_value(value: &JsonValue) -> ProstValue {
    let kind = match value {
        JsonValue::Null => Kind::NullValue(0),
        JsonValue::Bool(b) => Kind::BoolValue(*b),
        JsonValue::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        JsonValue::String(s) => Kind::StringValue(s.clone()),
        JsonValue::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_prost_value).collect(),
        }),
        JsonValue::Object(map) => Kind::StructValue(json_to_prost_struct(map)),
    };
    ProstValue { kind: Some(kind) }
}

fn json_to_prost_struct(map: &serde_json::Map<String, JsonValue>) -> ProstStruct {
    ProstStruct {
        fields: map.iter().map(|(k, v)| (k.clone(), json_to_prost_value(v))).collect(),
    }
}

/// Packs an arbitrary JSON object as a `Struct`-backed `Any` under the
/// fixed resource name used by its LinearCache entry (e.g. `"policy-state"`).
pub fn pack_json_bundle(name: &str, type_url: &str, value: &JsonValue) -> BuiltResource {
    let fields = match value {
        JsonValue::Object(map) => json_to_prost_struct(map),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            json_to_prost_struct(&map)
        }
    };

    BuiltResource {
        name: name.to_string(),
        resource: Any {
            type_url: type_url.to_string(),
            value: prost::Message::encode_to_vec(&fields),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_nested_json_object_without_panicking() {
        let payload = serde_json::json!({
            "routes": [{"routeKey": "GET|/x|vhost1", "policies": ["rateLimit"]}],
            "count": 1,
        });
        let resource = pack_json_bundle("policy-state", POLICY_STATE_TYPE_URL, &payload);
        assert_eq!(resource.name, "policy-state");
        assert_eq!(resource.resource.type_url, POLICY_STATE_TYPE_URL);
    }
}
