// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Helpers for enumerating local host addresses and resolving STUN servers.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use get_if_addrs::get_if_addrs;

use crate::conncheck::{MAX_HOST_CANDIDATES_COUNT, MAX_STUN_SERVER_RECORDS_COUNT};

pub(crate) fn address_is_ignorable(ip: IpAddr) -> bool {
    // TODO: add is_benchmarking() and is_documentation() when they become stable
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    match ip {
        IpAddr::V4(ipv4) => ipv4.is_broadcast() || ipv4.is_link_local(),
        IpAddr::V6(_ipv6) => false,
    }
}

fn is_link_local_v6(ip: &std::net::Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// The usable host addresses for a socket bound to `local_addr`, each
/// combined with the socket's port.
///
/// A socket bound to a specific address can only ever send from that
/// address, so it is the single host candidate even when it would normally
/// be ignorable (loopback-only test setups rely on this).  A wildcard bind
/// enumerates the machine's interfaces.
pub(crate) fn host_addresses(local_addr: SocketAddr) -> Vec<SocketAddr> {
    if !local_addr.ip().is_unspecified() {
        return vec![local_addr];
    }
    let port = local_addr.port();
    let want_ipv4 = local_addr.is_ipv4();
    let mut ret = vec![];
    let Ok(ifaces) = get_if_addrs() else {
        warn!("could not enumerate local interfaces");
        return ret;
    };
    for iface in ifaces {
        let ip = iface.ip();
        if address_is_ignorable(ip) {
            continue;
        }
        if ip.is_ipv4() != want_ipv4 {
            continue;
        }
        if ret.len() >= MAX_HOST_CANDIDATES_COUNT {
            break;
        }
        ret.push(SocketAddr::new(ip, port));
    }
    ret
}

/// The local preference (RFC 8445 §5.1.2.1) of a host address.  IPv6
/// addresses sort above IPv4 unless link-local; later addresses on the same
/// agent sort below earlier ones.
pub(crate) fn local_preference(addr: SocketAddr, index: usize) -> u32 {
    let base: u32 = match addr.ip() {
        IpAddr::V6(ip) if is_link_local_v6(&ip) => 16383,
        IpAddr::V6(_) => 65535,
        IpAddr::V4(_) => 32767,
    };
    base.saturating_sub(index as u32)
}

/// Resolve a `host:port` STUN server string to at most
/// [`MAX_STUN_SERVER_RECORDS_COUNT`] socket addresses, preferring the
/// socket's own address family.
pub(crate) fn resolve_stun_server(server: &str, want_ipv4: bool) -> Vec<SocketAddr> {
    let addrs: Vec<SocketAddr> = match server.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!("failed to resolve STUN server {server:?}: {e}");
            return vec![];
        }
    };
    let mut ret: Vec<SocketAddr> = addrs
        .iter()
        .filter(|addr| addr.is_ipv4() == want_ipv4)
        .take(MAX_STUN_SERVER_RECORDS_COUNT)
        .cloned()
        .collect();
    if ret.is_empty() {
        warn!("no address of the socket's family for STUN server {server:?}");
    }
    ret.truncate(MAX_STUN_SERVER_RECORDS_COUNT);
    ret
}
