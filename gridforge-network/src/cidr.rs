//! IPv4 CIDR parsing and membership tests. Subnets in the catalogue are
//! strings like `192.168.1.0/24`; peers are classified by longest prefix.

use gridforge_core::{CoreError, CoreResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(text: &str) -> CoreResult<Self> {
        let (addr_str, prefix_str) = text
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidConfig(format!("bad CIDR '{text}'")))?;
        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("bad CIDR address '{text}'")))?;
        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("bad CIDR prefix '{text}'")))?;
        if prefix > 32 {
            return Err(CoreError::InvalidConfig(format!(
                "CIDR prefix {prefix} out of range in '{text}'"
            )));
        }
        let mask = Self::mask(prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => u32::from(v4) & Self::mask(self.prefix) == self.network,
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_parse_and_contains() {
        let cidr = Ipv4Cidr::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(ip("192.168.1.10")));
        assert!(cidr.contains(ip("192.168.1.255")));
        assert!(!cidr.contains(ip("192.168.2.1")));
        assert!(!cidr.contains(ip("10.0.0.5")));
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_host_bits_are_masked() {
        let cidr = Ipv4Cidr::parse("10.0.0.99/8").unwrap();
        assert!(cidr.contains(ip("10.255.255.255")));
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_edge_prefixes() {
        let all = Ipv4Cidr::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(ip("203.0.113.7")));
        let host = Ipv4Cidr::parse("172.16.5.4/32").unwrap();
        assert!(host.contains(ip("172.16.5.4")));
        assert!(!host.contains(ip("172.16.5.5")));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Ipv4Cidr::parse("192.168.1.0").is_err());
        assert!(Ipv4Cidr::parse("192.168.1.0/33").is_err());
        assert!(Ipv4Cidr::parse("not-an-ip/24").is_err());
    }

    #[test]
    fn test_ipv6_never_matches() {
        let cidr = Ipv4Cidr::parse("0.0.0.0/0").unwrap();
        assert!(!cidr.contains(ip("::1")));
    }
}
