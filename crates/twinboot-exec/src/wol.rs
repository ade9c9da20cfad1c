//! Wake-on-LAN magic packets

use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::net::UdpSocket;
use tracing::{debug, instrument};

use crate::error::WakeError;

/// Default discard port used for magic packets
pub const DEFAULT_WOL_PORT: u16 = 9;

/// 6 x `0xFF` followed by the MAC repeated 16 times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; 102]);

impl MagicPacket {
    #[must_use]
    pub fn new(mac: [u8; 6]) -> Self {
        let mut packet = [0xFF_u8; 102];
        for chunk in packet[6..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&mac);
        }
        Self(packet)
    }

    /// Build a packet from `AA:BB:CC:DD:EE:FF` or `AA-BB-...` notation
    ///
    /// # Errors
    /// Returns `WakeError::InvalidMac` if the address is not 12 hex digits
    pub fn from_mac_str(mac: &str) -> Result<Self, WakeError> {
        parse_mac(mac).map(Self::new)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Parse a MAC address, ignoring `:` and `-` separators
///
/// # Errors
/// Returns `WakeError::InvalidMac` if the address is not 12 hex digits
pub fn parse_mac(mac: &str) -> Result<[u8; 6], WakeError> {
    let hex: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WakeError::InvalidMac(mac.to_string()));
    }

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| WakeError::InvalidMac(mac.to_string()))?;
    }
    Ok(out)
}

/// Directed broadcast address of an IPv4 CIDR, or the limited broadcast
/// address when no subnet is given
///
/// # Errors
/// Returns `WakeError::InvalidSubnet` for anything that is not `a.b.c.d/n`
pub fn broadcast_address(subnet: Option<&str>) -> Result<Ipv4Addr, WakeError> {
    let Some(subnet) = subnet else {
        return Ok(Ipv4Addr::BROADCAST);
    };

    let invalid = || WakeError::InvalidSubnet(subnet.to_string());
    let (addr, prefix) = subnet.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.trim().parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let host_mask = u32::MAX.checked_shr(prefix).unwrap_or(0);
    Ok(Ipv4Addr::from(u32::from(addr) | host_mask))
}

/// Send a magic packet to `target`
///
/// # Errors
/// Returns `WakeError::Send` if the socket cannot be set up or the send fails
#[instrument(skip(packet))]
pub async fn send_magic_packet(packet: &MagicPacket, target: SocketAddrV4) -> Result<(), WakeError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| WakeError::Send(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| WakeError::Send(e.to_string()))?;

    let sent = socket
        .send_to(packet.as_bytes(), target)
        .await
        .map_err(|e| WakeError::Send(e.to_string()))?;

    debug!(bytes = sent, %target, "magic packet sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_packet_layout() {
        let packet = MagicPacket::from_mac_str("AA:BB:CC:DD:EE:FF").unwrap();
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 102);
        assert_eq!(&bytes[..6], &[0xFF; 6]);
        assert_eq!(&bytes[6..12], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(&bytes[96..], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_parse_mac_accepts_dashes() {
        assert_eq!(
            parse_mac("01-23-45-67-89-ab").unwrap(),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]
        );
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("AA:BB:CC").is_err());
        assert!(parse_mac("GG:BB:CC:DD:EE:FF").is_err());
        assert!(parse_mac("").is_err());
    }

    #[test]
    fn test_broadcast_address_of_subnet() {
        assert_eq!(
            broadcast_address(Some("192.168.1.0/24")).unwrap(),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Some("10.20.0.0/16")).unwrap(),
            Ipv4Addr::new(10, 20, 255, 255)
        );
        assert_eq!(
            broadcast_address(Some("172.16.5.7/32")).unwrap(),
            Ipv4Addr::new(172, 16, 5, 7)
        );
        assert_eq!(broadcast_address(Some("0.0.0.0/0")).unwrap(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_broadcast_address_default() {
        assert_eq!(broadcast_address(None).unwrap(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_broadcast_address_invalid() {
        assert!(broadcast_address(Some("192.168.1.0")).is_err());
        assert!(broadcast_address(Some("192.168.1.0/33")).is_err());
        assert!(broadcast_address(Some("not-an-ip/24")).is_err());
    }

    #[tokio::test]
    async fn test_send_magic_packet_to_loopback() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let packet = MagicPacket::from_mac_str("AA:BB:CC:DD:EE:FF").unwrap();

        send_magic_packet(&packet, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let len = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], packet.as_bytes());
    }
}
