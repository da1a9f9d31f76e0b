//! JSON-RPC 1.1 envelope handling and method dispatch.

use crate::error::HomologyError;
use crate::orchestrator::HomologyService;
use homology_protocol::{GET_HOMOLOGS_METHOD, GetHomologsParams, RPC_VERSION, RpcErrorBody, STATUS_METHOD};
use serde_json::{Value, json};
use tracing::{Instrument, info_span, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

fn rpc_response(id: Value, result: Value) -> Value {
    json!({
        "version": RPC_VERSION,
        "id": id,
        "result": result
    })
}

pub fn rpc_error(id: Option<Value>, name: &str, code: i64, message: &str) -> Value {
    let error = RpcErrorBody {
        name: name.to_string(),
        code,
        message: message.to_string(),
    };
    json!({
        "version": RPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "error": error
    })
}

fn error_envelope(id: Option<Value>, err: &HomologyError) -> Value {
    rpc_error(id, err.kind(), err.rpc_code(), &err.to_string())
}

pub fn parse_error(detail: &str) -> Value {
    rpc_error(None, "ParseError", PARSE_ERROR, &format!("Parse error: {detail}"))
}

pub fn is_error(response: &Value) -> bool {
    response.get("error").is_some()
}

/// SDK clients call `Module.method`; only the method part matters here.
fn bare_method(method: &str) -> &str {
    method.rsplit('.').next().unwrap_or(method)
}

pub async fn handle_message(service: &HomologyService, message: &Value, token: Option<&str>) -> Value {
    let Some(obj) = message.as_object() else {
        return rpc_error(
            None,
            "InvalidRequest",
            INVALID_REQUEST,
            "Invalid Request: expected JSON object",
        );
    };
    let id = obj.get("id").cloned();
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return rpc_error(
            id,
            "InvalidRequest",
            INVALID_REQUEST,
            "Invalid Request: missing method field",
        );
    };
    let id_field = id.clone().unwrap_or(Value::Null);
    let span = info_span!("rpc", method, id = %id_field);

    async move {
        match bare_method(method) {
            GET_HOMOLOGS_METHOD => {
                let params = obj.get("params").cloned().unwrap_or(Value::Null);
                let params = match GetHomologsParams::from_rpc_params(&params) {
                    Ok(params) => params,
                    Err(err) => {
                        return error_envelope(id, &HomologyError::InvalidParams(err));
                    }
                };
                match service.get_homologs(params, token).await {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(value) => rpc_response(id.unwrap_or(Value::Null), value),
                        Err(e) => error_envelope(id, &HomologyError::from(e)),
                    },
                    Err(err) => {
                        warn!(kind = err.kind(), code = err.rpc_code(), "{err}");
                        error_envelope(id, &err)
                    }
                }
            }
            STATUS_METHOD => rpc_response(id.unwrap_or(Value::Null), service.status()),
            _ => rpc_error(
                id,
                "MethodNotFound",
                METHOD_NOT_FOUND,
                &format!("Method '{method}' not found"),
            ),
        }
    }
    .instrument(span)
    .await
}
