//! Local multicast conference loops
//!
//! One [`MediaLoop`] per configured loop name: a loopback receive socket the
//! site mixer sends into, the loop's multicast group for local delivery and
//! a random SSRC that remote peers learn during `connect_loops`. The SSRC is
//! drawn once and never changes for the loop's lifetime.
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
use crate::mixer::{volume_from_percent, LoopData, MixerData, MixerForward};
use loopgrid_types::Endpoint;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::debug;

/// RTP payload type announced in the mixer forward descriptor
pub const LOOP_PAYLOAD_TYPE: u8 = 100;
/// Default playback volume in percent
pub const LOOP_DEFAULT_VOLUME_PERCENT: u8 = 50;

/// One site-local conference loop
pub struct MediaLoop {
    name: String,
    multicast: Endpoint,
    multicast_addr: SocketAddr,
    ssrc: u32,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    mixer: Mutex<Option<MixerData>>,
}

impl MediaLoop {
    /// Open the loop's receive socket on an ephemeral port of the internal
    /// (loopback) host and draw the loop SSRC.
    pub async fn bind(
        name: &str,
        multicast: Endpoint,
        internal_host: &str,
    ) -> EngineResult<Arc<MediaLoop>> {
        if name.is_empty() {
            return Err(EngineError::Config("loop name must not be empty".to_string()));
        }
        if !multicast.is_set() {
            return Err(EngineError::Config(format!(
                "loop {name} has no multicast endpoint"
            )));
        }

        let multicast_addr = multicast.to_socket_addr()?;
        let socket = UdpSocket::bind((internal_host, 0)).await?;
        let local_addr = socket.local_addr()?;
        let ssrc: u32 = rand::random();

        debug!(
            loop_name = name,
            %local_addr,
            ssrc,
            "opened loop receiver"
        );

        Ok(Arc::new(MediaLoop {
            name: name.to_string(),
            multicast,
            multicast_addr,
            ssrc,
            socket: Arc::new(socket),
            local_addr,
            mixer: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable for the loop's lifetime
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Where the mixer's egress arrives
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive socket, shared with the node's per-loop reader task
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Deliver a buffer into the loop's multicast group
    pub async fn send(&self, buffer: &[u8]) -> EngineResult<()> {
        let sent = self.socket.send_to(buffer, self.multicast_addr).await?;
        if sent != buffer.len() {
            return Err(EngineError::Network(format!(
                "short multicast send on loop {}: {sent} of {} bytes",
                self.name,
                buffer.len()
            )));
        }
        Ok(())
    }

    /// Forward descriptor the mixer needs to feed this loop
    pub fn forward_descriptor(&self) -> MixerForward {
        MixerForward {
            socket: Endpoint::udp(self.local_addr.ip().to_string(), self.local_addr.port()),
            ssrc: self.ssrc,
            payload_type: LOOP_PAYLOAD_TYPE,
        }
    }

    /// Join payload for the mixer once acquisition succeeded
    pub fn loop_data(&self) -> LoopData {
        LoopData {
            name: self.name.clone(),
            socket: self.multicast.clone(),
            volume: volume_from_percent(LOOP_DEFAULT_VOLUME_PERCENT, 3),
        }
    }

    pub fn has_mixer(&self) -> bool {
        self.mixer.lock().unwrap().is_some()
    }

    pub fn mixer(&self) -> Option<MixerData> {
        self.mixer.lock().unwrap().clone()
    }

    /// Record the acquired slot
    pub fn set_mixer(&self, data: MixerData) {
        *self.mixer.lock().unwrap() = Some(data);
    }

    /// Release the slot, e.g. when its mixer disconnected
    pub fn clear_mixer(&self) -> Option<MixerData> {
        self.mixer.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_draws_ssrc_and_port() {
        let a = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();
        let b = MediaLoop::bind("beta", Endpoint::udp("224.0.0.8", 5002), "127.0.0.1")
            .await
            .unwrap();

        assert!(a.local_addr().port() != 0);
        assert!(a.local_addr().ip().is_loopback());
        // SSRC stays put
        assert_eq!(a.ssrc(), a.ssrc());
        // two loops get distinct receive ports
        assert_ne!(a.local_addr().port(), b.local_addr().port());
    }

    #[tokio::test]
    async fn test_rejects_unset_multicast() {
        let result = MediaLoop::bind("alpha", Endpoint::udp("", 0), "127.0.0.1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_forward_descriptor_points_at_receiver() {
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();

        let forward = media_loop.forward_descriptor();
        assert_eq!(forward.socket.port, media_loop.local_addr().port());
        assert_eq!(forward.ssrc, media_loop.ssrc());
        assert_eq!(forward.payload_type, LOOP_PAYLOAD_TYPE);
    }

    #[tokio::test]
    async fn test_loop_data_carries_multicast_and_volume() {
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();

        let data = media_loop.loop_data();
        assert_eq!(data.name, "alpha");
        assert_eq!(data.socket, Endpoint::udp("224.0.0.7", 5000));
        assert_eq!(data.volume, 4);
    }

    #[tokio::test]
    async fn test_mixer_slot_lifecycle() {
        let media_loop = MediaLoop::bind("alpha", Endpoint::udp("224.0.0.7", 5000), "127.0.0.1")
            .await
            .unwrap();
        assert!(!media_loop.has_mixer());

        media_loop.set_mixer(MixerData {
            remote: "127.0.0.1:9000".parse().unwrap(),
            user: "alpha".to_string(),
        });
        assert!(media_loop.has_mixer());

        let released = media_loop.clear_mixer().unwrap();
        assert_eq!(released.user, "alpha");
        assert!(!media_loop.has_mixer());
    }
}
