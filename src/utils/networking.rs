use crate::error::ClusterError;
use std::net::Ipv4Addr;

/// First host octet handed out on the mesh network
const MESH_HOST_OFFSET: usize = 11;

/// Extract the /24 network prefix from a mesh address or CIDR.
///
/// `10.5.3.6/24` yields `10.5.3`. Malformed addresses and prefix lengths
/// outside 0..=32 are rejected.
pub fn mesh_network_prefix(address: &str) -> Result<String, ClusterError> {
    let invalid = || ClusterError::InvalidMeshAddress(address.to_string());

    let (ip, prefix_len) = match address.split_once('/') {
        Some((ip, len)) => (ip, Some(len)),
        None => (address, None),
    };

    if let Some(len) = prefix_len {
        let len: u8 = len.parse().map_err(|_| invalid())?;
        if len > 32 {
            return Err(invalid());
        }
    }

    let ip: Ipv4Addr = ip.trim().parse().map_err(|_| invalid())?;
    let [a, b, c, _] = ip.octets();
    Ok(format!("{}.{}.{}", a, b, c))
}

/// Mesh address for the node at `index` within the cluster's node list
pub fn mesh_address(cidr: &str, index: usize) -> Result<String, ClusterError> {
    let prefix = mesh_network_prefix(cidr)?;
    let host = index + MESH_HOST_OFFSET;
    if host > 254 {
        return Err(ClusterError::InvalidMeshAddress(format!(
            "{} has no room for node #{}",
            cidr,
            index + 1
        )));
    }
    Ok(format!("{}.{}", prefix, host))
}

/// `host:port`
pub fn format_address(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}
