//! Uniform hypervisor capability set (spec §4.1), plus a JSON-RPC-over-HTTP
//! implementation of it that talks to an engine adapter.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::types::NetworkInfo;
use crate::wire::{RpcRequest, RpcResponse};

/// The capability set every engine adapter exposes, and every coordinator
/// component consumes. Implemented by [`EngineRpcClient`] for production use
/// and by hand-written fakes in tests, so the reservation/engine handlers
/// never depend on the transport.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn start_vm(&self, name: &str) -> Result<String>;
    async fn stop_vm(&self, name: &str) -> Result<String>;
    async fn reboot_vm(&self, name: &str) -> Result<String>;
    async fn create_vm(&self, template_name: &str, name: &str) -> Result<String>;
    async fn delete_vm(&self, name: &str) -> Result<String>;
    async fn get_vm_network_info(&self, name: &str) -> Result<NetworkInfo>;
    async fn run_command_on_vm(&self, name: &str, argv: &[String]) -> Result<String>;
    async fn is_vm_running(&self, name: &str) -> Result<bool>;
    async fn is_agent_running(&self, name: &str) -> Result<bool>;
    async fn get_resource_usage(&self) -> Result<Value>;
    async fn get_vm_config(&self, name: &str) -> Result<Value>;
    async fn get_template_config(&self, template_name: &str) -> Result<Value>;
    async fn vm_exists(&self, name: &str) -> Result<bool>;
    async fn get_all_vm_names(&self) -> Result<Vec<String>>;
}

/// JSON-RPC 2.0 client for a single engine endpoint (`http://host:port/api/v1`).
///
/// Stateless and cheap to construct: every call opens its own request, so
/// recreating one per engine lookup (as the engine handler's client
/// registry does) is safe.
pub struct EngineRpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: std::sync::atomic::AtomicU64,
}

impl EngineRpcClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Build the `http://host:port/api/v1` endpoint the spec mandates.
    pub fn for_host(host_ip: &str, port: u16) -> Self {
        Self::new(format!("http://{host_ip}:{port}/api/v1"))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);

        tracing::debug!(endpoint = %self.endpoint, method, "calling engine");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "engine returned HTTP {}",
                response.status()
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Malformed(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }

        body.result
            .ok_or_else(|| Error::Malformed(format!("{method} returned no result and no error")))
    }
}

#[async_trait]
impl EngineClient for EngineRpcClient {
    async fn start_vm(&self, name: &str) -> Result<String> {
        let v = self.call("start_vm", json!({"vm_name": name})).await?;
        as_string(v)
    }

    async fn stop_vm(&self, name: &str) -> Result<String> {
        let v = self.call("stop_vm", json!({"vm_name": name})).await?;
        as_string(v)
    }

    async fn reboot_vm(&self, name: &str) -> Result<String> {
        let v = self.call("reboot_vm", json!({"vm_name": name})).await?;
        as_string(v)
    }

    async fn create_vm(&self, template_name: &str, name: &str) -> Result<String> {
        let v = self
            .call(
                "create_vm",
                json!({"template_name": template_name, "vm_name": name}),
            )
            .await?;
        as_string(v)
    }

    async fn delete_vm(&self, name: &str) -> Result<String> {
        let v = self.call("delete_vm", json!({"vm_name": name})).await?;
        as_string(v)
    }

    async fn get_vm_network_info(&self, name: &str) -> Result<NetworkInfo> {
        let v = self
            .call("get_vm_network_info", json!({"vm_name": name}))
            .await?;
        serde_json::from_value(v).map_err(|e| Error::Malformed(e.to_string()))
    }

    async fn run_command_on_vm(&self, name: &str, argv: &[String]) -> Result<String> {
        let v = self
            .call(
                "run_command_on_vm",
                json!({"vm_name": name, "command": argv}),
            )
            .await?;
        as_string(v)
    }

    async fn is_vm_running(&self, name: &str) -> Result<bool> {
        let v = self
            .call("is_vm_running", json!({"vm_name": name}))
            .await?;
        as_bool(v)
    }

    async fn is_agent_running(&self, name: &str) -> Result<bool> {
        let v = self
            .call("is_agent_running", json!({"vm_name": name}))
            .await?;
        as_bool(v)
    }

    async fn get_resource_usage(&self) -> Result<Value> {
        self.call("get_node_resource_usage", json!({})).await
    }

    async fn get_vm_config(&self, name: &str) -> Result<Value> {
        self.call("get_vm_config", json!({"vm_name": name})).await
    }

    async fn get_template_config(&self, template_name: &str) -> Result<Value> {
        self.call(
            "get_template_config",
            json!({"template_name": template_name}),
        )
        .await
    }

    async fn vm_exists(&self, name: &str) -> Result<bool> {
        let v = self.call("vm_exists", json!({"vm_name": name})).await?;
        as_bool(v)
    }

    async fn get_all_vm_names(&self) -> Result<Vec<String>> {
        let v = self.call("get_all_vm_names", json!({})).await?;
        serde_json::from_value(v).map_err(|e| Error::Malformed(e.to_string()))
    }
}

fn as_string(v: Value) -> Result<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Malformed("expected a string result".to_string()))
}

fn as_bool(v: Value) -> Result<bool> {
    v.as_bool()
        .ok_or_else(|| Error::Malformed("expected a boolean result".to_string()))
}
