//! Value types exchanged over the hypervisor RPC surface.

use serde::{Deserialize, Serialize};

/// Guest network configuration, as reported by the engine's
/// `get_vm_network_info` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ip_address: String,
    pub subnet_mask: String,
}

impl NetworkInfo {
    /// `true` for an IPv4-autoconfiguration (APIPA) address, i.e. one the
    /// guest assigned itself because it never got a real DHCP lease.
    pub fn is_apipa(&self) -> bool {
        self.ip_address.starts_with("169.254.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_apipa_prefix() {
        let info = NetworkInfo {
            ip_address: "169.254.1.2".to_string(),
            subnet_mask: "255.255.0.0".to_string(),
        };
        assert!(info.is_apipa());

        let info = NetworkInfo {
            ip_address: "10.0.0.5".to_string(),
            subnet_mask: "255.255.255.0".to_string(),
        };
        assert!(!info.is_apipa());
    }
}
