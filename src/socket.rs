// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The agent's UDP socket and the interrupt channel used to wake the
//! worker out of its blocking receive.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Receive buffer size.  STUN requires at least 1200-byte datagrams;
/// application data may use anything up to the UDP maximum.
pub const RECV_BUFFER_SIZE: usize = 65536;

/// A UDP socket owned by one agent, shared lock-free between the worker
/// (receiving) and caller threads (sending).
#[derive(Debug)]
pub struct UdpSocketChannel {
    socket: UdpSocket,
    local_addr: SocketAddr,
    interrupt_addr: SocketAddr,
}

impl UdpSocketChannel {
    /// Bind to the given address (or the wildcard), optionally scanning a
    /// port range for a free port.
    pub fn bind(
        bind_address: Option<IpAddr>,
        port_range: Option<(u16, u16)>,
    ) -> io::Result<Self> {
        let ip = bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let socket = match port_range {
            None => UdpSocket::bind(SocketAddr::new(ip, 0))?,
            Some((lo, hi)) => {
                let mut bound = None;
                let mut last_err = None;
                for port in lo..=hi {
                    match UdpSocket::bind(SocketAddr::new(ip, port)) {
                        Ok(socket) => {
                            bound = Some(socket);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                bound.ok_or_else(|| {
                    last_err.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrInUse, "empty port range")
                    })
                })?
            }
        };
        let local_addr = socket.local_addr()?;
        // the address the interrupt datagram is sent to; a wildcard bind
        // is reachable through loopback
        let interrupt_addr = if local_addr.ip().is_unspecified() {
            let loopback = match local_addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            SocketAddr::new(loopback, local_addr.port())
        } else {
            local_addr
        };
        Ok(Self {
            socket,
            local_addr,
            interrupt_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, to)
    }

    /// Receive a datagram, blocking for at most `timeout` (`None` blocks
    /// until a datagram or an interrupt arrives).
    pub fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)> {
        // a zero timeout means "no timeout" to the OS; clamp upward
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.socket.set_read_timeout(timeout)?;
        self.socket.recv_from(buf)
    }

    /// Receive without blocking; `Ok(None)` when nothing is queued.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.socket.set_nonblocking(true)?;
        let result = self.socket.recv_from(buf);
        self.socket.set_nonblocking(false)?;
        match result {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wake a worker blocked in [`UdpSocketChannel::recv_from_timeout`] by
    /// sending a zero-length datagram to the socket itself.  Zero-length
    /// datagrams are ignored by the receive path.
    pub fn interrupt(&self) -> io::Result<()> {
        self.socket.send_to(&[], self.interrupt_addr).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn init() {
        crate::tests::test_init_log();
    }

    fn loopback() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn bind_ephemeral() {
        init();
        let channel = UdpSocketChannel::bind(loopback(), None).unwrap();
        assert_eq!(channel.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(channel.local_addr().port(), 0);
    }

    #[test]
    fn bind_port_range() {
        init();
        let channel = UdpSocketChannel::bind(loopback(), Some((40000, 40100))).unwrap();
        let port = channel.local_addr().port();
        assert!((40000..=40100).contains(&port));
        // the taken port is skipped
        let other = UdpSocketChannel::bind(loopback(), Some((port, port + 1))).unwrap();
        assert_eq!(other.local_addr().port(), port + 1);
    }

    #[test]
    fn send_and_receive() {
        init();
        let sender = UdpSocketChannel::bind(loopback(), None).unwrap();
        let receiver = UdpSocketChannel::bind(loopback(), None).unwrap();
        sender.send_to(b"hello", receiver.local_addr()).unwrap();
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (len, from) = receiver
            .recv_from_timeout(&mut buf, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, sender.local_addr());
    }

    #[test]
    fn interrupt_wakes_blocking_receive() {
        init();
        let channel = UdpSocketChannel::bind(loopback(), None).unwrap();
        channel.interrupt().unwrap();
        let mut buf = [0; 16];
        let start = Instant::now();
        let (len, _) = channel
            .recv_from_timeout(&mut buf, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(len, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn try_recv_empty() {
        init();
        let channel = UdpSocketChannel::bind(loopback(), None).unwrap();
        let mut buf = [0; 16];
        assert!(channel.try_recv_from(&mut buf).unwrap().is_none());
        channel.send_to(b"x", channel.local_addr()).unwrap();
        // give loopback delivery a moment
        std::thread::sleep(Duration::from_millis(50));
        let (len, _) = channel.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(len, 1);
    }
}
