//! SRTP keying and packet protection
//!
//! Keying material comes out of the DTLS handshake via the RFC 5764
//! exporter. The layout is fixed:
//!
//! ```text
//! [0..16]   client_write_key
//! [16..32]  server_write_key
//! [32..46]  client_write_salt
//! [46..60]  server_write_salt
//! ```
//!
//! Whichever side initiated the handshake writes with the client half; the
//! other side writes with the server half. Packet protection itself is
//! libsrtp through the `srtp` bindings.
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
use srtp::CryptoPolicy;

/// RFC 5764 exporter label
pub const KEYING_LABEL: &str = "EXTRACTOR-dtls_srtp";
/// AES-128 master key size
pub const MASTER_KEY_LEN: usize = 16;
/// 112 bit master salt
pub const MASTER_SALT_LEN: usize = 14;
/// Exported material: client and server key plus client and server salt
pub const KEY_MATERIAL_LEN: usize = 2 * (MASTER_KEY_LEN + MASTER_SALT_LEN);

/// SRTP profiles the node offers in the DTLS use_srtp extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmHmacSha1_80,
    Aes128CmHmacSha1_32,
}

impl SrtpProfile {
    /// Map the profile name OpenSSL reports after the handshake
    pub fn from_negotiated_name(name: &str) -> Option<SrtpProfile> {
        match name {
            "SRTP_AES128_CM_SHA1_80" => Some(SrtpProfile::Aes128CmHmacSha1_80),
            "SRTP_AES128_CM_SHA1_32" => Some(SrtpProfile::Aes128CmHmacSha1_32),
            _ => None,
        }
    }

    fn crypto_policy(&self) -> CryptoPolicy {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => CryptoPolicy::aes_cm_128_hmac_sha1_80(),
            SrtpProfile::Aes128CmHmacSha1_32 => CryptoPolicy::aes_cm_128_hmac_sha1_32(),
        }
    }
}

/// Which side of the handshake this node played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyingRole {
    /// Initiated the handshake, writes with the client half
    Active,
    /// Answered the handshake, writes with the server half
    Passive,
}

/// Local and remote key+salt halves of the exported material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyingMaterial {
    /// Key material this node protects with
    pub local: Vec<u8>,
    /// Key material the peer protects with
    pub remote: Vec<u8>,
}

impl KeyingMaterial {
    /// Split the exporter output by the fixed RFC 5764 layout
    pub fn split(material: &[u8], role: KeyingRole) -> EngineResult<KeyingMaterial> {
        if material.len() != KEY_MATERIAL_LEN {
            return Err(EngineError::Srtp(format!(
                "keying material must be {KEY_MATERIAL_LEN} bytes, got {}",
                material.len()
            )));
        }

        let (client_key, rest) = material.split_at(MASTER_KEY_LEN);
        let (server_key, rest) = rest.split_at(MASTER_KEY_LEN);
        let (client_salt, server_salt) = rest.split_at(MASTER_SALT_LEN);

        let client = [client_key, client_salt].concat();
        let server = [server_key, server_salt].concat();

        let (local, remote) = match role {
            KeyingRole::Active => (client, server),
            KeyingRole::Passive => (server, client),
        };

        Ok(KeyingMaterial { local, remote })
    }
}

/// One direction of SRTP protection
pub struct SrtpStream {
    session: srtp::Session,
}

impl SrtpStream {
    /// Stream that unprotects packets the peer sent
    pub fn inbound(profile: SrtpProfile, key_and_salt: &[u8]) -> EngineResult<SrtpStream> {
        let policy = profile.crypto_policy();
        let session = srtp::Session::with_inbound_template(srtp::StreamPolicy {
            rtp: policy,
            rtcp: policy,
            key: key_and_salt,
            ..Default::default()
        })
        .map_err(|e| EngineError::Srtp(format!("inbound session: {e}")))?;

        Ok(SrtpStream { session })
    }

    /// Stream that protects packets this node sends
    pub fn outbound(profile: SrtpProfile, key_and_salt: &[u8]) -> EngineResult<SrtpStream> {
        let policy = profile.crypto_policy();
        let session = srtp::Session::with_outbound_template(srtp::StreamPolicy {
            rtp: policy,
            rtcp: policy,
            key: key_and_salt,
            ..Default::default()
        })
        .map_err(|e| EngineError::Srtp(format!("outbound session: {e}")))?;

        Ok(SrtpStream { session })
    }

    /// Protect an RTP packet in place; the buffer grows by the auth trailer
    pub fn protect(&mut self, packet: &mut Vec<u8>) -> EngineResult<()> {
        self.session
            .protect(packet)
            .map_err(|e| EngineError::Srtp(format!("protect: {e}")))
    }

    /// Unprotect an SRTP packet in place
    pub fn unprotect(&mut self, packet: &mut Vec<u8>) -> EngineResult<()> {
        self.session
            .unprotect(packet)
            .map_err(|e| EngineError::Srtp(format!("unprotect: {e}")))
    }
}

/// The two directions of one media session
pub struct SrtpPair {
    pub inbound: SrtpStream,
    pub outbound: SrtpStream,
}

impl SrtpPair {
    /// Build both directions from exported keying material
    pub fn from_material(profile: SrtpProfile, keys: &KeyingMaterial) -> EngineResult<SrtpPair> {
        Ok(SrtpPair {
            inbound: SrtpStream::inbound(profile, &keys.remote)?,
            outbound: SrtpStream::outbound(profile, &keys.local)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> Vec<u8> {
        (0..KEY_MATERIAL_LEN as u8).collect()
    }

    #[test]
    fn test_split_layout_active() {
        let keys = KeyingMaterial::split(&material(), KeyingRole::Active).unwrap();

        // client key | client salt
        let mut expected_local: Vec<u8> = (0..16).collect();
        expected_local.extend(32..46);
        // server key | server salt
        let mut expected_remote: Vec<u8> = (16..32).collect();
        expected_remote.extend(46..60);

        assert_eq!(keys.local, expected_local);
        assert_eq!(keys.remote, expected_remote);
    }

    #[test]
    fn test_split_halves_swap_by_role() {
        let active = KeyingMaterial::split(&material(), KeyingRole::Active).unwrap();
        let passive = KeyingMaterial::split(&material(), KeyingRole::Passive).unwrap();

        assert_eq!(active.local, passive.remote);
        assert_eq!(active.remote, passive.local);
    }

    #[test]
    fn test_split_rejects_wrong_length() {
        assert!(KeyingMaterial::split(&[0u8; 59], KeyingRole::Active).is_err());
        assert!(KeyingMaterial::split(&[0u8; 61], KeyingRole::Passive).is_err());
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(
            SrtpProfile::from_negotiated_name("SRTP_AES128_CM_SHA1_80"),
            Some(SrtpProfile::Aes128CmHmacSha1_80)
        );
        assert_eq!(
            SrtpProfile::from_negotiated_name("SRTP_AES128_CM_SHA1_32"),
            Some(SrtpProfile::Aes128CmHmacSha1_32)
        );
        assert_eq!(SrtpProfile::from_negotiated_name("SRTP_AEAD_AES_128_GCM"), None);
    }
}
