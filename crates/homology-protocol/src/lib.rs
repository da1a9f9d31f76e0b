//! Wire contracts shared by the homology JSON-RPC service, its clients and
//! the remote search backend.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const GET_HOMOLOGS_METHOD: &str = "get_homologs";
pub const STATUS_METHOD: &str = "status";

/// JSON-RPC version string written into every response envelope.
pub const RPC_VERSION: &str = "1.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHomologsParams {
    pub ws_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_max_results: Option<i64>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub bypass_caching: bool,
}

/// SDK clients send flags as `true`/`false`, `1`/`0` or `null`.
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(flag),
        Value::Null => Ok(false),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        other => Err(serde::de::Error::custom(format!(
            "expected a boolean or 0/1, got {other}"
        ))),
    }
}

impl GetHomologsParams {
    pub fn new(ws_ref: impl Into<String>) -> Self {
        Self {
            ws_ref: ws_ref.into(),
            n_max_results: None,
            bypass_caching: false,
        }
    }

    /// Accepts both `{"ws_ref": ..}` and the SDK-style `[{"ws_ref": ..}]`.
    pub fn from_rpc_params(params: &Value) -> Result<Self, String> {
        let object = match params {
            Value::Object(_) => params.clone(),
            Value::Array(items) => match items.as_slice() {
                [single @ Value::Object(_)] => single.clone(),
                [] => return Err("params array is empty; expected one object".to_string()),
                _ => {
                    return Err(format!(
                        "params array must contain exactly one object, got {} item(s)",
                        items.len()
                    ));
                }
            },
            Value::Null => return Err("missing params; 'ws_ref' is required".to_string()),
            other => return Err(format!("params must be an object, got {other}")),
        };
        serde_json::from_value(object).map_err(|e| format!("Invalid params: {e}"))
    }
}

/// One nearest-neighbour record as returned by the search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomologyHit {
    pub sourceid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaceid: Option<String>,
    pub dist: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HomologyHit {
    pub fn strain(&self) -> Option<&str> {
        self.extra.get("strain").and_then(Value::as_str)
    }
}

/// Body of a successful `POST /namespace/{db}/search`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub distances: Vec<HomologyHit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Value>,
}

/// A backend hit after its external id has been mapped to a workspace id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRecord {
    pub kbase_id: Option<String>,
    pub sourceid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaceid: Option<String>,
    pub dist: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unresolved: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomologsResult {
    pub distances: Vec<DistanceRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Value>,
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub name: String,
    pub code: i64,
    pub message: String,
}
