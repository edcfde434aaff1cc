use std::net::Ipv4Addr;

use nix::net::if_::InterfaceFlags;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to retrieve the local hostname")]
    Hostname(#[source] nix::Error),
}

/// A host-local IPv4 network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub addr: Ipv4Addr,
}

pub fn hostname() -> Result<String, NodeError> {
    match nix::unistd::gethostname() {
        Ok(hostname) => Ok(hostname.to_string_lossy().into_owned()),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname: {error}");

            Err(NodeError::Hostname(error))
        }
    }
}

/// List the usable IPv4 interfaces of this host. Loopback and downed
/// interfaces are skipped, so the result may be empty.
pub fn get_networks() -> Vec<Network> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(error) => {
            warn!(error = ?error, "Failed to enumerate network interfaces: {error}");
            return Vec::new();
        }
    };

    let mut networks = Vec::new();
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
        {
            continue;
        }

        if let Some(addr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            networks.push(Network {
                name: ifaddr.interface_name.clone(),
                addr: Ipv4Addr::from(addr.ip()),
            });
        }
    }

    networks
}

/// Order interfaces so that every process derives the same preferred
/// data network from the same interface list.
pub fn sorted_networks(mut networks: Vec<Network>) -> Vec<Network> {
    networks.sort_by(|a, b| a.addr.octets().cmp(&b.addr.octets()).then_with(|| a.name.cmp(&b.name)));
    networks
}

/// Address of the preferred data network, if the host has one besides
/// loopback.
pub fn data_name() -> Option<String> {
    sorted_networks(get_networks())
        .first()
        .map(|network| network.addr.to_string())
}
