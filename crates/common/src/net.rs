//! IP address helpers used when reporting guest addresses

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::Ipv4Network;

/// RFC 3927 link-local: 169.254.0.0/16 minus the reserved first and last /24.
pub fn is_ipv4_link_local(ip: &str) -> bool {
    let Ok(addr) = ip.trim().parse::<Ipv4Addr>() else {
        return false;
    };
    let [a, b, c, _] = addr.octets();
    a == 169 && b == 254 && c != 0 && c != 255
}

/// fe80::/10, accepted in any letter case.
pub fn is_ipv6_link_local(ip: &str) -> bool {
    let Ok(addr) = ip.trim().parse::<Ipv6Addr>() else {
        return false;
    };
    addr.segments()[0] & 0xffc0 == 0xfe80
}

pub fn is_link_local(ip: &str) -> bool {
    is_ipv4_link_local(ip) || is_ipv6_link_local(ip)
}

/// `a.b.c.d/len`; a bare address is not a CIDR even though it parses as a /32.
pub fn is_ipv4_cidr(value: &str) -> bool {
    value.contains('/') && Ipv4Network::from_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_link_local() {
        assert!(is_ipv4_link_local("169.254.1.1"));
        assert!(!is_ipv4_link_local("169.254.0.1"));
        assert!(!is_ipv4_link_local("169.254.255.1"));
        assert!(!is_ipv4_link_local("10.0.0.1"));
        assert!(!is_ipv4_link_local("not-an-ip"));
    }

    #[test]
    fn test_ipv6_link_local() {
        assert!(is_ipv6_link_local("fe80::1"));
        assert!(is_ipv6_link_local("FE80::1"));
        assert!(is_ipv6_link_local("febf::1"));
        assert!(!is_ipv6_link_local("fec0::1"));
        assert!(!is_ipv6_link_local("2001:db8::1"));
    }

    #[test]
    fn test_cidr() {
        assert!(is_ipv4_cidr("172.16.0.0/24"));
        assert!(!is_ipv4_cidr("172.16.0.0/33"));
        assert!(!is_ipv4_cidr("172.16.0.0"));
        assert!(is_ipv4_cidr("10.52.0.1/32"));
        assert!(!is_ipv4_cidr("256.16.0.0/24"));
        assert!(!is_ipv4_cidr("fd00::/64"));
        assert!(!is_ipv4_cidr("172.16.0.0/"));
    }
}
