//! JSON-RPC 2.0 HTTP endpoint (spec §4.1): a single POST route that
//! dispatches by `method` onto the [`ProxmoxEngine`] driver and always
//! answers with HTTP 200, carrying success/failure in the JSON-RPC
//! envelope as the spec's wire contract requires.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use hypervisor_rpc::wire::{RpcErrorObject, RpcResponse};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::AdapterError;
use crate::proxmox::ProxmoxEngine;

#[derive(serde::Deserialize)]
struct RpcRequestBody {
    id: Option<u64>,
    method: String,
    #[serde(default)]
    params: Value,
}

pub fn router(engine: Arc<ProxmoxEngine>) -> Router {
    Router::new()
        .route("/api/v1", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn handle_rpc(
    State(engine): State<Arc<ProxmoxEngine>>,
    Json(req): Json<RpcRequestBody>,
) -> Json<RpcResponse> {
    let id = req.id;
    match dispatch(&engine, &req.method, req.params).await {
        Ok(result) => Json(RpcResponse {
            id,
            result: Some(result),
            error: None,
        }),
        Err(e) => Json(RpcResponse {
            id,
            result: None,
            error: Some(RpcErrorObject {
                code: e.rpc_code(),
                message: e.to_string(),
                data: None,
            }),
        }),
    }
}

fn param_str(params: &Value, key: &str) -> crate::error::Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdapterError::Malformed(format!("missing string param '{key}'")))
}

fn param_argv(params: &Value, key: &str) -> crate::error::Result<Vec<String>> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| AdapterError::Malformed(format!("missing array param '{key}'")))
}

async fn dispatch(
    engine: &ProxmoxEngine,
    method: &str,
    params: Value,
) -> crate::error::Result<Value> {
    match method {
        "start_vm" => {
            let name = param_str(&params, "vm_name")?;
            engine.start_vm(&name).await.map(|s| json!(s))
        }
        "stop_vm" => {
            let name = param_str(&params, "vm_name")?;
            engine.stop_vm(&name).await.map(|s| json!(s))
        }
        "reboot_vm" => {
            let name = param_str(&params, "vm_name")?;
            engine.reboot_vm(&name).await.map(|s| json!(s))
        }
        "create_vm" => {
            let template_name = param_str(&params, "template_name")?;
            let name = param_str(&params, "vm_name")?;
            engine
                .create_vm(&template_name, &name)
                .await
                .map(|s| json!(s))
        }
        "delete_vm" => {
            let name = param_str(&params, "vm_name")?;
            engine.delete_vm(&name).await.map(|s| json!(s))
        }
        "get_vm_network_info" => {
            let name = param_str(&params, "vm_name")?;
            engine
                .get_vm_network_info(&name)
                .await
                .and_then(|info| {
                    serde_json::to_value(info)
                        .map_err(|e| AdapterError::Malformed(e.to_string()))
                })
        }
        "run_command_on_vm" => {
            let name = param_str(&params, "vm_name")?;
            let argv = param_argv(&params, "command")?;
            engine
                .run_command_on_vm(&name, &argv)
                .await
                .map(|s| json!(s))
        }
        "is_vm_running" => {
            let name = param_str(&params, "vm_name")?;
            engine.is_vm_running(&name).await.map(|b| json!(b))
        }
        "is_agent_running" => {
            let name = param_str(&params, "vm_name")?;
            engine.is_agent_running(&name).await.map(|b| json!(b))
        }
        "get_node_resource_usage" => engine.get_resource_usage().await,
        "get_vm_config" => {
            let name = param_str(&params, "vm_name")?;
            engine.get_vm_config(&name).await
        }
        "get_template_config" => {
            let template_name = param_str(&params, "template_name")?;
            engine.get_template_config(&template_name).await
        }
        "vm_exists" => {
            let name = param_str(&params, "vm_name")?;
            engine.vm_exists(&name).await.map(|b| json!(b))
        }
        "get_all_vm_names" => engine.get_all_vm_names().await.map(|names| json!(names)),
        other => Err(AdapterError::Malformed(format!("unknown method '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_vm_name() {
        let err = param_str(&json!({}), "vm_name").unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }
}
