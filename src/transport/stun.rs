//! Public address discovery through STUN binding requests (RFC 5389).
//!
//! Only the small subset the traversal needs is implemented: assemble a
//! binding request, validate the binding success response and pull the
//! mapped address out of it. The XOR-obfuscated attribute is preferred
//! over the plain one so that application layer gateways rewriting
//! addresses in packet payloads cannot corrupt the result.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use log::{debug, warn};

use crate::{
    packet::buffer::{ByteReader, ByteWriter},
    transport::error::{StunError, TransportError},
};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const STUN_PORT: u16 = 3478;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// How long to wait on each candidate server before moving on.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds a binding request and returns it with the transaction id the
/// response must echo.
pub fn build_binding_request() -> (Vec<u8>, [u8; 12]) {
    let mut transaction_id = [0u8; 12];
    for byte in transaction_id.iter_mut() {
        *byte = fastrand::u8(..);
    }
    let mut writer = ByteWriter::new();
    writer.write_u16(BINDING_REQUEST);
    writer.write_u16(0); // no attributes
    writer.write_u32(MAGIC_COOKIE);
    writer.write_bytes(&transaction_id);
    (writer.into_bytes(), transaction_id)
}

/// Validates a binding response and extracts the mapped address.
pub fn parse_binding_response(
    data: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddrV4, StunError> {
    if data.len() < 20 {
        return Err(StunError::TooShort);
    }
    let mut reader = ByteReader::new(data);
    let response_type = reader.read_u16()?;
    if response_type != BINDING_SUCCESS {
        return Err(StunError::NotBindingSuccess { response_type });
    }
    reader.read_u16()?; // message length
    if reader.read_u32()? != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie);
    }
    if reader.read_bytes(12)? != transaction_id.as_slice() {
        return Err(StunError::TransactionIdMismatch);
    }

    let mut plain_addr: Option<SocketAddrV4> = None;
    let mut xor_addr: Option<SocketAddrV4> = None;
    while reader.remaining() >= 4 {
        let raw_type = reader.read_u16()?;
        let length = reader.read_u16()?;
        // The comprehension-optional and IETF-review bits do not change
        // the attribute's meaning (RFC 5389 sections 15 and 18.1).
        let attr_type = raw_type & !(1 << 15 | 1 << 14);
        if attr_type == ATTR_MAPPED_ADDRESS || attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if length != 8 || reader.remaining() < 8 {
                return Err(StunError::BadAttributeLength { length });
            }
            reader.skip(1)?; // reserved
            let family = reader.read_u8()?;
            if family != FAMILY_IPV4 {
                return Err(StunError::UnsupportedFamily);
            }
            let mut port = reader.read_u16()?;
            let mut ip = reader.read_u32()?;
            if attr_type == ATTR_XOR_MAPPED_ADDRESS {
                port ^= (MAGIC_COOKIE >> 16) as u16;
                ip ^= MAGIC_COOKIE;
                xor_addr = Some(SocketAddrV4::new(Ipv4Addr::from(ip), port));
            } else {
                plain_addr = Some(SocketAddrV4::new(Ipv4Addr::from(ip), port));
            }
        } else {
            // Attributes are padded out to 4-byte alignment.
            let padded = (length as usize + 3) & !3;
            if reader.remaining() < padded {
                break;
            }
            reader.skip(padded)?;
        }
    }

    if xor_addr.is_none() && plain_addr.is_some() {
        warn!("stun server returned only a non xor-mapped address");
    }
    xor_addr.or(plain_addr).ok_or(StunError::NoMappedAddress)
}

/// Queries candidate STUN servers in shuffled order until one yields a
/// public address. The servers are hostnames, resolved here; exhausting
/// the pool reports [`TransportError::NoPublicAddress`] so the caller
/// can fall back to LAN-only operation.
pub fn resolve_public_address(
    socket: &UdpSocket,
    servers: &[String],
) -> Result<SocketAddrV4, TransportError> {
    let mut pool: Vec<&String> = servers.iter().collect();
    fastrand::shuffle(&mut pool);

    let previous_timeout = socket.read_timeout()?;
    socket.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
    let result = try_servers(socket, &pool);
    socket.set_read_timeout(previous_timeout)?;

    result.ok_or(TransportError::NoPublicAddress {
        attempted: pool.len(),
    })
}

fn try_servers(socket: &UdpSocket, pool: &[&String]) -> Option<SocketAddrV4> {
    let mut buffer = [0u8; 2048];
    for server in pool {
        let server_addr = match resolve_server(server) {
            Some(addr) => addr,
            None => {
                warn!("could not resolve stun server {}", server);
                continue;
            }
        };
        debug!("using stun server {} at {}", server, server_addr);

        let (request, transaction_id) = build_binding_request();
        if let Err(e) = socket.send_to(&request, server_addr) {
            warn!("failed to send stun request to {}: {}", server, e);
            continue;
        }
        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) => {
                warn!("no stun response from {}: {}", server, e);
                continue;
            }
        };
        if from.ip() != server_addr.ip() {
            warn!("stun response came from {} instead of {}", from, server_addr);
        }
        match parse_binding_response(&buffer[..len], &transaction_id) {
            Ok(address) => {
                debug!("stun server {} reports public address {}", server, address);
                return Some(address);
            }
            Err(e) => warn!("invalid stun response from {}: {}", server, e),
        }
    }
    None
}

fn resolve_server(server: &str) -> Option<SocketAddr> {
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, STUN_PORT)
    };
    target
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(
        transaction_id: &[u8; 12],
        attr_type: u16,
        port: u16,
        ip: u32,
    ) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u16(BINDING_SUCCESS);
        writer.write_u16(12);
        writer.write_u32(MAGIC_COOKIE);
        writer.write_bytes(transaction_id);
        writer.write_u16(attr_type);
        writer.write_u16(8);
        writer.write_u8(0);
        writer.write_u8(FAMILY_IPV4);
        writer.write_u16(port);
        writer.write_u32(ip);
        writer.into_bytes()
    }

    #[test]
    fn request_has_rfc_layout() {
        let (request, transaction_id) = build_binding_request();
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..], &transaction_id[..]);
    }

    #[test]
    fn plain_mapped_address_is_parsed() {
        let txid = [7u8; 12];
        let ip = u32::from(Ipv4Addr::new(203, 0, 113, 9));
        let data = response_with_attr(&txid, ATTR_MAPPED_ADDRESS, 2757, ip);
        let addr = parse_binding_response(&data, &txid).unwrap();
        assert_eq!(addr, "203.0.113.9:2757".parse().unwrap());
    }

    #[test]
    fn xor_mapped_address_is_deobfuscated_and_preferred() {
        let txid = [7u8; 12];
        let ip = u32::from(Ipv4Addr::new(203, 0, 113, 9));
        let mut data = response_with_attr(
            &txid,
            ATTR_XOR_MAPPED_ADDRESS,
            2757 ^ (MAGIC_COOKIE >> 16) as u16,
            ip ^ MAGIC_COOKIE,
        );
        // A conflicting plain attribute after the xor one must lose.
        let decoy = response_with_attr(&txid, ATTR_MAPPED_ADDRESS, 1, 1);
        data.extend_from_slice(&decoy[20..]);
        data[3] = 24; // two attributes now

        let addr = parse_binding_response(&data, &txid).unwrap();
        assert_eq!(addr, "203.0.113.9:2757".parse().unwrap());
    }

    #[test]
    fn bad_cookie_is_rejected() {
        let txid = [7u8; 12];
        let mut data = response_with_attr(&txid, ATTR_MAPPED_ADDRESS, 1, 1);
        data[4] = 0;
        assert!(matches!(
            parse_binding_response(&data, &txid),
            Err(StunError::BadMagicCookie)
        ));
    }

    #[test]
    fn wrong_transaction_id_is_rejected() {
        let txid = [7u8; 12];
        let data = response_with_attr(&txid, ATTR_MAPPED_ADDRESS, 1, 1);
        assert!(matches!(
            parse_binding_response(&data, &[8u8; 12]),
            Err(StunError::TransactionIdMismatch)
        ));
    }

    #[test]
    fn unknown_attributes_are_skipped_with_padding() {
        let txid = [7u8; 12];
        let mut writer = ByteWriter::new();
        writer.write_u16(BINDING_SUCCESS);
        writer.write_u16(8 + 12);
        writer.write_u32(MAGIC_COOKIE);
        writer.write_bytes(&txid);
        // SOFTWARE attribute, 5 bytes, padded to 8.
        writer.write_u16(0x8022);
        writer.write_u16(5);
        writer.write_bytes(b"corgi\0\0\0");
        let decoy = response_with_attr(&txid, ATTR_MAPPED_ADDRESS, 9, 9);
        let mut data = writer.into_bytes();
        data.extend_from_slice(&decoy[20..]);

        let addr = parse_binding_response(&data, &txid).unwrap();
        assert_eq!(addr.port(), 9);
    }
}
