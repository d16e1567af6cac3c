//! Site-to-site interconnect engine for the Loopgrid conference fabric
//!
//! Each site runs one interconnect node; pairs of nodes splice their local
//! multicast conference loops together over an authenticated control
//! channel and a DTLS-SRTP media path. This crate provides:
//! - The DTLS 1.2 context with rotating HelloVerifyRequest cookies
//! - Per-peer media sessions (handshake, SRTP keying, keepalive)
//! - RFC 7983 demultiplexing on the shared media socket
//! - Loop plumbing and SSRC rewriting in both directions
//! - The mixer acquisition protocol
//! - The interconnect node tying it all together
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


pub mod control;
pub mod demux;
pub mod dtls;
pub mod error;
pub mod filter;
pub mod loops;
pub mod messages;
pub mod mixer;
pub mod node;
pub mod session;
pub mod srtp;
pub mod stun;

// Re-export main types
pub use control::{ChannelKind, ConnectionHandle, ControlEvent, ControlIo};
pub use demux::PacketKind;
pub use dtls::{
    fingerprint_matches, fingerprint_of_cert, fingerprint_rfc8122, verify_fingerprint,
    CookieKeyset, DtlsContext, DtlsRole,
};
pub use error::{EngineError, EngineResult};
pub use filter::DatagramChannel;
pub use loops::MediaLoop;
pub use mixer::{LoopData, MixerData, MixerForward, MixerRegistry};
pub use node::Interconnect;
pub use session::{
    LoopSync, MediaSession, SessionConfig, SessionEvent, SessionState,
};
pub use srtp::{KeyingMaterial, KeyingRole, SrtpPair, SrtpProfile, SrtpStream};
