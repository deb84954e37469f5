use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use conductor_engine::EngineError;

/// Incoming RPC request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// Wire format: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

pub const PARSE_ERROR: &str = "PARSE_ERROR";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Serialize `value` as the result, or fail with an internal error.
    pub fn from_serializable<T: Serialize>(id: Option<serde_json::Value>, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(result) => Self::success(id, result),
            Err(e) => Self::internal_error(id, format!("failed to encode result: {e}")),
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Engine failures carry their own kind, e.g. `NOT_FOUND` or `RATE_LIMITED`.
    pub fn engine_error(id: Option<serde_json::Value>, error: &EngineError) -> Self {
        Self::error(id, error.code().to_ascii_uppercase(), error.to_string())
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }
}

/// Decode the whole params object into a typed struct.
pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(params.clone()).map_err(|e| format!("Invalid params: {e}"))
}

/// Extract an optional u64 param.
pub fn optional_u64(params: &serde_json::Value, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::errors::ApiError;

    #[test]
    fn parse_rpc_request() {
        let json = r#"{"method":"agent.get","params":{"run_id":12},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "agent.get");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn request_without_params_or_id() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"system.ping"}"#).unwrap();
        assert!(req.params.is_none());
        assert!(req.id.is_none());
    }

    #[test]
    fn success_response_serializes() {
        let resp = RpcResponse::success(Some(serde_json::json!(1)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn error_response_serializes() {
        let resp = RpcResponse::method_not_found(Some(serde_json::json!(1)), "foo.bar");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "METHOD_NOT_FOUND");
        assert!(json["error"]["message"].as_str().unwrap().contains("foo.bar"));
        assert!(json.get("result").is_none());
    }

    #[test]
    fn engine_errors_use_their_kind_as_code() {
        let err = EngineError::Api(ApiError::NotFound("run 9".into()));
        let resp = RpcResponse::engine_error(None, &err);
        assert_eq!(resp.error.unwrap().code, "NOT_FOUND");

        let err = EngineError::InvalidInput("query".into());
        let resp = RpcResponse::engine_error(None, &err);
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn parse_params_reports_missing_fields() {
        #[derive(Debug, Deserialize)]
        struct P {
            #[allow(dead_code)]
            query: String,
        }
        let err = parse_params::<P>(&serde_json::json!({})).unwrap_err();
        assert!(err.contains("query"));
    }

    #[test]
    fn parse_error_has_no_id() {
        let resp = RpcResponse::parse_error();
        assert!(resp.id.is_none());
        assert_eq!(resp.error.as_ref().unwrap().code, PARSE_ERROR);
        assert!(!resp.success);
    }
}
