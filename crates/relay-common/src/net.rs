use std::io;
use std::net::{IpAddr, UdpSocket};

/// Determine the address this replica is reachable on.
///
/// Opens an unconnected UDP socket towards a public address and reads the
/// local address the kernel picked for it. No packet is sent.
pub fn external_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip())
}
