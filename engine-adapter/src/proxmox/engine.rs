//! Proxmox-flavored reference engine driver (spec §4.2).
//!
//! Owns the cached template/VM maps and the monotonic `highest_vmid`
//! counter described in the spec, and implements the convergence
//! semantics (poll-until-observed) that make the surface in
//! `hypervisor_rpc::EngineClient` safe to call from a coordinator that
//! only trusts observed post-conditions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use hypervisor_rpc::types::NetworkInfo;
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{AdapterError, Result};
use crate::proxmox::api::ProxmoxApi;

const STARTING_VMID: u64 = 100;
const DELETE_POLL_ATTEMPTS: u32 = 10;
const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CREATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(5);
const EXEC_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ProxmoxEngine {
    api: ProxmoxApi,
    primary_node: String,
    templates: RwLock<HashMap<String, Value>>,
    vms: RwLock<HashMap<String, Value>>,
    highest_vmid: AtomicU64,
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"IPv4 Address[. ]?(?:\. )+: (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap()
    })
}

fn subnet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Subnet Mask[. ]?(?:\. )+: (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap()
    })
}

impl ProxmoxEngine {
    /// Construct the driver and prime its caches. Mirrors the original's
    /// `__init__` calling `reload_ids`/`reload_templates`/`reload_vms`
    /// eagerly so the adapter is ready to serve as soon as it's up.
    pub async fn connect(api: ProxmoxApi, primary_node: String) -> Result<Self> {
        let engine = Self {
            api,
            primary_node,
            templates: RwLock::new(HashMap::new()),
            vms: RwLock::new(HashMap::new()),
            highest_vmid: AtomicU64::new(STARTING_VMID),
        };
        engine.reload_all().await?;
        Ok(engine)
    }

    async fn reload_all(&self) -> Result<()> {
        let entries = self.api.list_qemu(&self.primary_node).await?;

        let mut templates = HashMap::new();
        let mut vms = HashMap::new();
        let mut highest = STARTING_VMID;

        for entry in entries {
            let vmid = entry.get("vmid").and_then(Value::as_u64).unwrap_or(0);
            highest = highest.max(vmid + 1);

            let is_template = entry.get("template").and_then(Value::as_u64) == Some(1);
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if is_template {
                templates.insert(name, entry);
            } else {
                vms.insert(name, entry);
            }
        }

        *self.templates.write().await = templates;
        *self.vms.write().await = vms;
        self.highest_vmid.fetch_max(highest, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_vms(&self) -> Result<()> {
        self.reload_all().await
    }

    fn next_vmid(&self) -> u64 {
        self.highest_vmid.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn vmid_of(&self, vm_name: &str) -> Result<u64> {
        self.vms
            .read()
            .await
            .get(vm_name)
            .and_then(|v| v.get("vmid"))
            .and_then(Value::as_u64)
            .ok_or_else(|| AdapterError::VmNotFound(vm_name.to_string()))
    }

    async fn template_vmid(&self, template_name: &str) -> Option<u64> {
        self.templates
            .read()
            .await
            .get(template_name)
            .and_then(|v| v.get("vmid"))
            .and_then(Value::as_u64)
    }

    pub async fn vm_exists(&self, vm_name: &str) -> Result<bool> {
        Ok(self.vms.read().await.contains_key(vm_name))
    }

    pub async fn get_all_vm_names(&self) -> Result<Vec<String>> {
        Ok(self.vms.read().await.keys().cloned().collect())
    }

    pub async fn get_vm_config(&self, vm_name: &str) -> Result<Value> {
        let vmid = self.vmid_of(vm_name).await?;
        self.api.qemu_config(&self.primary_node, vmid).await
    }

    pub async fn get_template_config(&self, template_name: &str) -> Result<Value> {
        let vmid = self
            .template_vmid(template_name)
            .await
            .ok_or_else(|| AdapterError::UnknownTemplate(template_name.to_string()))?;
        self.api.qemu_config(&self.primary_node, vmid).await
    }

    pub async fn get_resource_usage(&self) -> Result<Value> {
        self.api.node_status(&self.primary_node).await
    }

    pub async fn is_vm_running(&self, vm_name: &str) -> Result<bool> {
        let vmid = self.vmid_of(vm_name).await?;
        let status = self.api.status_current(&self.primary_node, vmid).await?;
        Ok(status.get("status").and_then(Value::as_str) == Some("running"))
    }

    pub async fn is_agent_running(&self, vm_name: &str) -> Result<bool> {
        let vmid = match self.vmid_of(vm_name).await {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };
        match self
            .api
            .agent_exec(&self.primary_node, vmid, &["whoami".to_string()])
            .await
        {
            Ok(_) => Ok(true),
            Err(AdapterError::ApiError(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn start_vm(&self, vm_name: &str) -> Result<String> {
        let vmid = self.vmid_of(vm_name).await?;
        let resp = self.api.start_vm(&self.primary_node, vmid).await?;
        info!(vm_name, ?resp, "start_vm requested");
        Ok("VM start requested".to_string())
    }

    pub async fn stop_vm(&self, vm_name: &str) -> Result<String> {
        let vmid = self.vmid_of(vm_name).await?;
        let resp = self.api.stop_vm(&self.primary_node, vmid).await?;
        info!(vm_name, ?resp, "stop_vm requested");
        Ok("VM stop requested".to_string())
    }

    /// If the VM isn't running, starting it stands in for a reboot - ported
    /// from the original, which treats "reboot a stopped VM" as "just start
    /// it" rather than an error.
    pub async fn reboot_vm(&self, vm_name: &str) -> Result<String> {
        if !self.is_vm_running(vm_name).await? {
            self.start_vm(vm_name).await?;
            return Ok("VM started".to_string());
        }
        let vmid = self.vmid_of(vm_name).await?;
        let resp = self.api.reboot_vm(&self.primary_node, vmid).await?;
        info!(vm_name, ?resp, "reboot_vm requested");
        Ok("VM reboot requested".to_string())
    }

    pub async fn create_vm(&self, template_name: &str, vm_name: &str) -> Result<String> {
        info!(template_name, vm_name, "creating VM");
        let newid = self.next_vmid();

        let Some(template_vmid) = self.template_vmid(template_name).await else {
            return Err(AdapterError::UnknownTemplate(template_name.to_string()));
        };

        self.api
            .clone_vm(&self.primary_node, template_vmid, newid, vm_name)
            .await?;

        hypervisor_rpc::wait_until_true(
            &format!("VM {vm_name} to appear after clone"),
            None,
            CREATE_POLL_INTERVAL,
            || async {
                self.reload_vms().await.map_err(to_hyp_err)?;
                Ok(self.vms.read().await.contains_key(vm_name))
            },
        )
        .await
        .map_err(from_hyp_err)?;

        Ok("VM created".to_string())
    }

    pub async fn delete_vm(&self, vm_name: &str) -> Result<String> {
        if !self.vm_exists(vm_name).await? {
            return Ok("VM does not exist".to_string());
        }

        if self.is_vm_running(vm_name).await? {
            self.stop_vm(vm_name).await?;
            info!(vm_name, "waiting for VM to stop");
            hypervisor_rpc::wait_until_true(
                &format!("VM {vm_name} to stop"),
                None,
                RUNNING_POLL_INTERVAL,
                || async { Ok(!self.is_vm_running(vm_name).await.map_err(to_hyp_err)?) },
            )
            .await
            .map_err(from_hyp_err)?;
        }

        let vmid = self.vmid_of(vm_name).await?;
        if let Err(e) = self.api.delete_vm(&self.primary_node, vmid).await {
            warn!(vm_name, error = %e, "error while deleting VM");
            return Err(e);
        }

        for _ in 0..DELETE_POLL_ATTEMPTS {
            self.reload_vms().await?;
            if !self.vms.read().await.contains_key(vm_name) {
                info!(vm_name, "VM deleted successfully");
                return Ok("VM deleted".to_string());
            }
            tokio::time::sleep(DELETE_POLL_INTERVAL).await;
        }

        Ok("Timeout reached while waiting for VM to be deleted".to_string())
    }

    pub async fn run_command_on_vm(&self, vm_name: &str, argv: &[String]) -> Result<String> {
        let vmid = self.vmid_of(vm_name).await?;
        let pid = self.api.agent_exec(&self.primary_node, vmid, argv).await?;

        loop {
            let status = self
                .api
                .agent_exec_status(&self.primary_node, vmid, pid)
                .await?;
            if status.get("exited").and_then(Value::as_i64) == Some(1) {
                return Ok(status
                    .get("out-data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string());
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    /// Parses IPv4 address and subnet mask out of a Windows `ipconfig /all`
    /// transcript - the guest is assumed Windows, matching the original.
    pub async fn get_vm_network_info(&self, vm_name: &str) -> Result<NetworkInfo> {
        let output = self
            .run_command_on_vm(vm_name, &["ipconfig".to_string(), "/all".to_string()])
            .await?;

        let ip = ipv4_regex()
            .captures(&output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| AdapterError::Malformed("no IPv4 address in ipconfig output".into()))?;
        let mask = subnet_regex()
            .captures(&output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| AdapterError::Malformed("no subnet mask in ipconfig output".into()))?;

        Ok(NetworkInfo {
            ip_address: ip,
            subnet_mask: mask,
        })
    }
}

fn to_hyp_err(e: AdapterError) -> hypervisor_rpc::Error {
    hypervisor_rpc::Error::Rpc {
        code: e.rpc_code(),
        message: e.to_string(),
        data: None,
    }
}

fn from_hyp_err(e: hypervisor_rpc::Error) -> AdapterError {
    match e {
        hypervisor_rpc::Error::Timeout(label) => AdapterError::Timeout(label),
        other => AdapterError::ApiError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipconfig_transcript() {
        let sample = "Ethernet adapter Ethernet:\r\n\r\n   \
            IPv4 Address. . . . . . . . . . . : 10.0.0.42\r\n   \
            Subnet Mask . . . . . . . . . . . : 255.255.255.0\r\n";

        let ip = ipv4_regex()
            .captures(sample)
            .and_then(|c| c.get(1))
            .unwrap()
            .as_str();
        let mask = subnet_regex()
            .captures(sample)
            .and_then(|c| c.get(1))
            .unwrap()
            .as_str();

        assert_eq!(ip, "10.0.0.42");
        assert_eq!(mask, "255.255.255.0");
    }
}
