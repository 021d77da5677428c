//! sniproxy/src/proxy_header.rs
//! PROXY protocol v1 prefix emission (SPEC_FULL.md §4.E), grounded on the
//! teacher's own outbound-PROXY-header code (`connection.rs`), which builds
//! exactly this kind of prefix with the `ppp` crate from a (source,
//! destination) address pair.

use std::net::SocketAddr;

/// Builds the `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>\r\n` prefix, or
/// `PROXY UNKNOWN\r\n` when the two addresses are not both IPv4 or both
/// IPv6 (SPEC_FULL.md §4.E).
pub fn build_v1_header(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    let same_family = matches!(
        (source, destination),
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_))
    );
    if !same_family {
        return b"PROXY UNKNOWN\r\n".to_vec();
    }
    let addresses = ppp::v1::Addresses::from((source, destination));
    format!("{addresses}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tcp4_header() {
        let src = "203.0.113.5:40000".parse().unwrap();
        let dst = "198.51.100.9:443".parse().unwrap();
        let header = build_v1_header(src, dst);
        assert_eq!(
            header,
            b"PROXY TCP4 203.0.113.5 198.51.100.9 40000 443\r\n"
        );
    }

    #[test]
    fn builds_unknown_header_on_family_mismatch() {
        let src = "203.0.113.5:40000".parse().unwrap();
        let dst = "[::1]:443".parse().unwrap();
        assert_eq!(build_v1_header(src, dst), b"PROXY UNKNOWN\r\n");
    }
}
