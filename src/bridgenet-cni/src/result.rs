//! CNI Result types
//!
//! Output formats for CNI operations as defined in CNI Spec 1.0.0

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Result returned by ADD operation
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteConfig>>,
}

impl CniResult {
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            interfaces: None,
            ips: None,
            routes: None,
        }
    }

    /// Add an interface to the result
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        let iface = Interface { name, mac, sandbox };
        self.interfaces.get_or_insert_with(Vec::new).push(iface);
        self
    }

    /// Add an IP configuration bound to the interface at `interface`
    pub fn with_ip(mut self, address: Ipv4Net, gateway: Option<Ipv4Addr>, interface: usize) -> Self {
        let ip = IpConfig {
            address: address.to_string(),
            gateway: gateway.map(|gw| gw.to_string()),
            interface: Some(interface),
        };
        self.ips.get_or_insert_with(Vec::new).push(ip);
        self
    }

    /// Add a route; `dst` is in CIDR notation (e.g. "0.0.0.0/0")
    pub fn with_route(mut self, dst: String, gw: Option<Ipv4Addr>) -> Self {
        let route = RouteConfig {
            dst,
            gw: gw.map(|gw| gw.to_string()),
        };
        self.routes.get_or_insert_with(Vec::new).push(route);
        self
    }
}

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,

    pub mac: String,

    /// Network namespace path (for container-side interfaces)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// IP address in CIDR notation
    pub address: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into interfaces array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination network in CIDR notation
    pub dst: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Result returned by VERSION operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,

    pub supported_versions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cni_result_builder() {
        let result = CniResult::new("1.0.0".to_string())
            .with_interface(
                "eth0".to_string(),
                "02:42:ac:11:00:02".to_string(),
                Some("/var/run/netns/ctr".to_string()),
            )
            .with_ip(
                "10.244.0.2/24".parse().unwrap(),
                Some("10.244.0.1".parse().unwrap()),
                0,
            )
            .with_route("0.0.0.0/0".to_string(), Some("10.244.0.1".parse().unwrap()));

        assert_eq!(result.cni_version, "1.0.0");
        assert_eq!(result.interfaces.as_ref().unwrap().len(), 1);
        let ips = result.ips.as_ref().unwrap();
        assert_eq!(ips[0].address, "10.244.0.2/24");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.244.0.1"));
        assert_eq!(result.routes.as_ref().unwrap()[0].dst, "0.0.0.0/0");
    }

    #[test]
    fn test_result_serialization() {
        let result = CniResult::new("1.0.0".to_string())
            .with_ip("10.244.0.2/24".parse().unwrap(), None, 0);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"1.0.0\""));
        assert!(json.contains("\"ips\""));
        assert!(!json.contains("\"interfaces\""));
        assert!(!json.contains("\"gateway\""));
    }

    #[test]
    fn test_version_result() {
        let result = VersionResult {
            cni_version: "1.0.0".to_string(),
            supported_versions: vec!["0.4.0".to_string(), "1.0.0".to_string()],
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"1.0.0\""));
        assert!(json.contains("\"supportedVersions\""));
    }
}
