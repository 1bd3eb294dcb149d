//! Local interface addresses, for telling users where a listener can be reached.

use std::io::Error;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub is_loopback: bool,
}

pub fn list_interface_ips() -> Result<Vec<InterfaceIp>, Error> {
    let mut out: Vec<InterfaceIp> = if_addrs::get_if_addrs()?
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            InterfaceIp {
                is_loopback: ip.is_loopback(),
                name: ifa.name,
                ip,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// First non-loopback IPv4 address, or 127.0.0.1 when there is none.
pub fn local_ip() -> IpAddr {
    list_interface_ips()
        .ok()
        .and_then(|ips| pick_local_ip(&ips))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn pick_local_ip(ips: &[InterfaceIp]) -> Option<IpAddr> {
    ips.iter()
        .find(|item| item.ip.is_ipv4() && !item.is_loopback)
        .map(|item| item.ip)
}
