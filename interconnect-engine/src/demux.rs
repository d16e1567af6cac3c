//! RFC 7983 first-byte demultiplexing
//!
//! STUN, DTLS and SRTP share the one media socket. The first byte of every
//! datagram decides where it goes:
//!
//! ```text
//!                   BYTE 1
//!             +----------------+
//!             |        [0..3] -+--> STUN
//! packet -->  |      [20..63] -+--> DTLS
//!             |    [128..191] -+--> RTP / RTCP
//!             +----------------+
//! ```
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


/// Classification of a datagram on the media socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// STUN message (binding only)
    Stun,
    /// DTLS record
    Dtls,
    /// RTP or RTCP packet
    Rtp,
    /// Anything else is dropped
    Unknown,
}

impl PacketKind {
    /// Classify a datagram by its first byte
    pub fn identify(buffer: &[u8]) -> PacketKind {
        match buffer.first() {
            Some(0..=3) => PacketKind::Stun,
            Some(20..=63) => PacketKind::Dtls,
            Some(128..=191) => PacketKind::Rtp,
            _ => PacketKind::Unknown,
        }
    }
}
