//! Minimal STUN support for the media socket
//!
//! The media path only ever answers binding requests (RFC 5389) with a
//! success response carrying XOR-MAPPED-ADDRESS, and emits binding requests
//! as keepalives. Nothing else of STUN is implemented.
// Copyright 2026 Loopgrid Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{EngineError, EngineResult};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr};

/// STUN magic cookie (RFC 5389 section 6)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;
/// Fixed STUN header size
pub const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// True when the buffer is a well-formed STUN frame with the magic cookie
pub fn is_valid_frame(buffer: &[u8]) -> bool {
    if buffer.len() < HEADER_LEN {
        return false;
    }
    // Top two bits of the type must be zero
    if buffer[0] & 0xC0 != 0 {
        return false;
    }
    let cookie = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
    if cookie != MAGIC_COOKIE {
        return false;
    }
    let length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    buffer.len() >= HEADER_LEN + length
}

/// True when the frame is a binding request
pub fn is_binding_request(buffer: &[u8]) -> bool {
    is_valid_frame(buffer)
        && u16::from_be_bytes([buffer[0], buffer[1]]) == BINDING_REQUEST
}

/// True when the frame is a binding success response
pub fn is_success_response(buffer: &[u8]) -> bool {
    is_valid_frame(buffer)
        && u16::from_be_bytes([buffer[0], buffer[1]]) == BINDING_SUCCESS
}

/// Transaction id of a valid frame
pub fn transaction_id(buffer: &[u8]) -> Option<[u8; 12]> {
    if !is_valid_frame(buffer) {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&buffer[8..20]);
    Some(id)
}

/// Build a binding request with a random transaction id (keepalive probe)
pub fn binding_request() -> Vec<u8> {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);

    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(&id);
    out
}

/// Build the binding success response for a request, mapping `remote`
pub fn binding_success_response(request: &[u8], remote: SocketAddr) -> EngineResult<Vec<u8>> {
    let id = transaction_id(request)
        .ok_or_else(|| EngineError::Stun("not a valid STUN frame".to_string()))?;

    let attr = encode_xor_mapped_address(remote, &id);

    let mut out = Vec::with_capacity(HEADER_LEN + 4 + attr.len());
    out.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    out.extend_from_slice(&((attr.len() + 4) as u16).to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(&id);
    out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    out.extend_from_slice(&(attr.len() as u16).to_be_bytes());
    out.extend_from_slice(&attr);
    Ok(out)
}

/// Encode XOR-MAPPED-ADDRESS: port and address are XORed against the magic
/// cookie (and the transaction id for IPv6)
fn encode_xor_mapped_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.push(0); // Reserved

    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    match addr.ip() {
        IpAddr::V4(ip) => {
            bytes.push(FAMILY_IPV4);
            bytes.extend_from_slice(&xor_port.to_be_bytes());
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for (i, octet) in ip.octets().iter().enumerate() {
                bytes.push(octet ^ cookie[i]);
            }
        }
        IpAddr::V6(ip) => {
            bytes.push(FAMILY_IPV6);
            bytes.extend_from_slice(&xor_port.to_be_bytes());
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            for (i, octet) in ip.octets().iter().enumerate() {
                bytes.push(octet ^ mask[i]);
            }
        }
    }

    bytes
}

/// Decode an XOR-MAPPED-ADDRESS attribute value back to a socket address
pub fn decode_xor_mapped_address(
    value: &[u8],
    transaction_id: &[u8; 12],
) -> EngineResult<SocketAddr> {
    if value.len() < 8 {
        return Err(EngineError::Stun("attribute too short".to_string()));
    }

    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match value[1] {
        FAMILY_IPV4 => {
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = value[4 + i] ^ cookie[i];
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(EngineError::Stun("attribute too short".to_string()));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        family => Err(EngineError::Stun(format!("unknown family {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_shape() {
        let request = binding_request();
        assert_eq!(request.len(), HEADER_LEN);
        assert!(is_binding_request(&request));
        assert!(!is_success_response(&request));
        // the first byte sits in the STUN band of the RFC 7983 table
        assert!(request[0] <= 3);
    }

    #[test]
    fn test_response_echoes_transaction_id() {
        let request = binding_request();
        let remote: SocketAddr = "192.0.2.17:40312".parse().unwrap();
        let response = binding_success_response(&request, remote).unwrap();

        assert!(is_success_response(&response));
        assert_eq!(
            transaction_id(&response).unwrap(),
            transaction_id(&request).unwrap()
        );
    }

    #[test]
    fn test_xor_mapped_address_round_trip_v4() {
        let id = transaction_id(&binding_request()).unwrap();
        let addr: SocketAddr = "203.0.113.9:5061".parse().unwrap();

        let encoded = encode_xor_mapped_address(addr, &id);
        let decoded = decode_xor_mapped_address(&encoded, &id).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_xor_mapped_address_round_trip_v6() {
        let id = transaction_id(&binding_request()).unwrap();
        let addr: SocketAddr = "[2001:db8::42]:6000".parse().unwrap();

        let encoded = encode_xor_mapped_address(addr, &id);
        let decoded = decode_xor_mapped_address(&encoded, &id).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_rejects_frames_without_cookie() {
        let mut request = binding_request();
        request[4] = 0;
        assert!(!is_valid_frame(&request));
        assert!(!is_binding_request(&request));
    }

    #[test]
    fn test_rejects_short_buffers() {
        assert!(!is_valid_frame(&[0u8; 8]));
        assert!(transaction_id(&[0u8; 8]).is_none());
    }
}
