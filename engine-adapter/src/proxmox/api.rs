//! Thin REST client over the real Proxmox VE API, mirroring the shape of
//! `proxmoxer.ProxmoxAPI` from the original Python implementation: one
//! method per endpoint the engine driver needs, ticket-based auth handled
//! transparently.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ProxmoxConfig;
use crate::error::{AdapterError, Result};

pub struct ProxmoxApi {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    ticket: tokio::sync::RwLock<Option<Auth>>,
}

struct Auth {
    ticket: String,
    csrf_token: String,
}

impl ProxmoxApi {
    pub fn new(config: &ProxmoxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;

        if !config.verify_ssl {
            warn!("PROXMOX_VERIFY_SSL disabled, TLS certificate validation is off");
        }

        Ok(Self {
            http,
            base_url: format!("https://{}:8006/api2/json", config.host),
            user: config.user.clone(),
            password: config.password.clone(),
            ticket: tokio::sync::RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<Auth> {
        debug!(user = %self.user, "authenticating with Proxmox");
        let resp = self
            .http
            .post(format!("{}/access/ticket", self.base_url))
            .form(&[("username", self.user.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AdapterError::ApiError(format!(
                "login failed with HTTP {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        let data = body
            .get("data")
            .ok_or_else(|| AdapterError::Malformed("login response missing data".to_string()))?;

        let ticket = data
            .get("ticket")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Malformed("login response missing ticket".to_string()))?
            .to_string();
        let csrf_token = data
            .get("CSRFPreventionToken")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::Malformed("login response missing CSRF token".to_string())
            })?
            .to_string();

        Ok(Auth { ticket, csrf_token })
    }

    async fn ensure_authenticated(&self) -> Result<()> {
        if self.ticket.read().await.is_some() {
            return Ok(());
        }
        let auth = self.login().await?;
        *self.ticket.write().await = Some(auth);
        Ok(())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        self.ensure_authenticated().await?;

        for attempt in 0..2 {
            let (cookie, csrf) = {
                let guard = self.ticket.read().await;
                let auth = guard.as_ref().expect("authenticated above");
                (
                    format!("PVEAuthCookie={}", auth.ticket),
                    auth.csrf_token.clone(),
                )
            };

            let mut req = self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header(reqwest::header::COOKIE, cookie);

            if method != reqwest::Method::GET {
                req = req.header("CSRFPreventionToken", csrf);
            }
            if let Some(ref b) = body {
                req = req.json(b);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("Proxmox ticket expired, re-authenticating");
                *self.ticket.write().await = None;
                self.ensure_authenticated().await?;
                continue;
            }

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(AdapterError::ApiError(format!("HTTP {status}: {text}")));
            }

            let parsed: Value = resp
                .json()
                .await
                .map_err(|e| AdapterError::Malformed(e.to_string()))?;
            return Ok(parsed.get("data").cloned().unwrap_or(Value::Null));
        }

        unreachable!("loop always returns or errors within two attempts")
    }

    pub async fn list_qemu(&self, node: &str) -> Result<Vec<Value>> {
        let data = self
            .request(reqwest::Method::GET, &format!("/nodes/{node}/qemu"), None)
            .await?;
        data.as_array()
            .cloned()
            .ok_or_else(|| AdapterError::Malformed("expected VM list array".to_string()))
    }

    pub async fn clone_vm(&self, node: &str, template_vmid: u64, newid: u64, name: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/nodes/{node}/qemu/{template_vmid}/clone"),
            Some(json!({"newid": newid, "name": name})),
        )
        .await?;
        Ok(())
    }

    pub async fn status_current(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/nodes/{node}/qemu/{vmid}/status/current"),
            None,
        )
        .await
    }

    pub async fn start_vm(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/nodes/{node}/qemu/{vmid}/status/start"),
            Some(json!({})),
        )
        .await
    }

    pub async fn stop_vm(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/nodes/{node}/qemu/{vmid}/status/stop"),
            Some(json!({})),
        )
        .await
    }

    pub async fn reboot_vm(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            &format!("/nodes/{node}/qemu/{vmid}/status/reboot"),
            Some(json!({})),
        )
        .await
    }

    pub async fn delete_vm(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/nodes/{node}/qemu/{vmid}"),
            None,
        )
        .await
    }

    pub async fn agent_exec(&self, node: &str, vmid: u64, command: &[String]) -> Result<i64> {
        let data = self
            .request(
                reqwest::Method::POST,
                &format!("/nodes/{node}/qemu/{vmid}/agent/exec"),
                Some(json!({"command": command})),
            )
            .await?;
        data.get("pid")
            .and_then(Value::as_i64)
            .ok_or_else(|| AdapterError::Malformed("exec response missing pid".to_string()))
    }

    pub async fn agent_exec_status(&self, node: &str, vmid: u64, pid: i64) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/nodes/{node}/qemu/{vmid}/agent/exec-status?pid={pid}"),
            None,
        )
        .await
    }

    pub async fn node_status(&self, node: &str) -> Result<Value> {
        self.request(reqwest::Method::GET, &format!("/nodes/{node}/status"), None)
            .await
    }

    pub async fn qemu_config(&self, node: &str, vmid: u64) -> Result<Value> {
        self.request(
            reqwest::Method::GET,
            &format!("/nodes/{node}/qemu/{vmid}/config"),
            None,
        )
        .await
    }
}
