use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Addressing for one guest interface and its host tap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIfaceConfig {
    pub host_ip: String,
    pub guest_ip: String,
    pub tap_name: String,
    pub dev_name: String,
    pub netmask_len: u8,
}

impl Default for NetIfaceConfig {
    fn default() -> Self {
        Self {
            host_ip: "192.168.0.1".to_string(),
            guest_ip: "192.168.0.2".to_string(),
            tap_name: "tap0".to_string(),
            dev_name: "eth0".to_string(),
            netmask_len: 30,
        }
    }
}

impl NetIfaceConfig {
    /// The `i`-th interface: 192.168.i.1/.2 on tap{i}/eth{i}.
    pub fn with_id(i: u8) -> Self {
        Self {
            host_ip: format!("192.168.{}.1", i),
            guest_ip: format!("192.168.{}.2", i),
            tap_name: format!("tap{}", i),
            dev_name: format!("eth{}", i),
            netmask_len: 30,
        }
    }

    /// Firecracker interface id; the guest device name doubles as it.
    pub fn iface_id(&self) -> &str {
        &self.dev_name
    }

    pub fn guest_mac(&self) -> Result<String> {
        mac_from_ip(&self.guest_ip)
    }
}

/// Derive the guest MAC from its IPv4 address: `06:00:` followed by the four
/// address bytes. The guest image computes its IP back from this MAC.
pub fn mac_from_ip(ip: &str) -> Result<String> {
    let addr: Ipv4Addr = ip
        .parse()
        .with_context(|| format!("invalid guest IPv4 address: {:?}", ip))?;
    let [a, b, c, d] = addr.octets();
    if addr.is_unspecified() {
        bail!("guest address cannot be 0.0.0.0");
    }
    Ok(format!("06:00:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_from_ip() {
        assert_eq!(mac_from_ip("192.168.241.2").unwrap(), "06:00:c0:a8:f1:02");
        assert_eq!(mac_from_ip("10.0.0.1").unwrap(), "06:00:0a:00:00:01");
    }

    #[test]
    fn test_mac_from_ip_invalid() {
        assert!(mac_from_ip("not-an-ip").is_err());
        assert!(mac_from_ip("0.0.0.0").is_err());
    }

    #[test]
    fn test_iface_defaults_and_ids() {
        let default = NetIfaceConfig::default();
        assert_eq!(default.tap_name, "tap0");
        assert_eq!(default.iface_id(), "eth0");
        assert_eq!(default.guest_mac().unwrap(), "06:00:c0:a8:00:02");

        let third = NetIfaceConfig::with_id(3);
        assert_eq!(third.host_ip, "192.168.3.1");
        assert_eq!(third.guest_ip, "192.168.3.2");
        assert_eq!(third.tap_name, "tap3");
        assert_eq!(third.dev_name, "eth3");
    }
}
