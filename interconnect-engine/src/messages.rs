//! Control-channel message builders
//!
//! The small set of envelopes the node originates. Handlers fill response
//! envelopes through [`loopgrid_types::Envelope`] directly; everything that
//! starts a new exchange is built here.
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


use crate::mixer::{LoopData, MixerForward};
use loopgrid_types::Envelope;
use serde_json::{json, Value};

/// The only codec an interconnect accepts
pub const DEFAULT_CODEC: &str = "opus/48000/2";

/// Signaling event names
pub const EVENT_REGISTER: &str = "register";
pub const EVENT_CONNECT_MEDIA: &str = "connect_media";
pub const EVENT_CONNECT_LOOPS: &str = "connect_loops";

/// Mixer event names
pub const EVENT_CONFIGURE: &str = "configure";
pub const EVENT_ACQUIRE: &str = "acquire";
pub const EVENT_JOIN: &str = "join";

/// `register {name, password}` sent after the signaling client connects
pub fn register(name: &str, password: &str) -> Envelope {
    Envelope::new(EVENT_REGISTER).with_parameter(json!({
        "name": name,
        "password": password,
    }))
}

/// `connect_media {name, codec, host, port}` offering the local media socket
pub fn connect_media(name: &str, codec: &str, host: &str, port: u16) -> Envelope {
    Envelope::new(EVENT_CONNECT_MEDIA).with_parameter(json!({
        "name": name,
        "codec": codec,
        "host": host,
        "port": port,
    }))
}

/// Bare `connect_loops`; the caller populates the parameter with the loop
/// definitions
pub fn connect_loops() -> Envelope {
    Envelope::new(EVENT_CONNECT_LOOPS)
}

/// `configure` pushed to a mixer after it registered
pub fn mixer_configure(config: &Value) -> Envelope {
    Envelope::new(EVENT_CONFIGURE).with_parameter(json!({
        "mixer": config,
    }))
}

/// `acquire {user, forward}` reserving a mixer user for a loop
pub fn mixer_acquire(user: &str, forward: &MixerForward) -> Envelope {
    Envelope::new(EVENT_ACQUIRE).with_parameter(json!({
        "user": user,
        "forward": forward,
    }))
}

/// `join {loop}` subscribing the reserved user to the loop's multicast group
pub fn mixer_join(data: &LoopData) -> Envelope {
    Envelope::new(EVENT_JOIN).with_parameter(json!({
        "loop": data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopgrid_types::Endpoint;

    #[test]
    fn test_register_shape() {
        let msg = register("site1", "secret");
        assert_eq!(msg.event, EVENT_REGISTER);
        assert_eq!(msg.parameter_str("name"), Some("site1"));
        assert_eq!(msg.parameter_str("password"), Some("secret"));
        assert!(!msg.is_answer());
    }

    #[test]
    fn test_connect_media_shape() {
        let msg = connect_media("site1", DEFAULT_CODEC, "10.0.0.1", 40000);
        assert_eq!(msg.event, EVENT_CONNECT_MEDIA);
        assert_eq!(msg.parameter_str("codec"), Some(DEFAULT_CODEC));
        assert_eq!(msg.parameter_u64("port"), Some(40000));
    }

    #[test]
    fn test_connect_loops_is_bare() {
        let msg = connect_loops();
        assert_eq!(msg.event, EVENT_CONNECT_LOOPS);
        assert!(msg.parameter.is_none());
    }

    #[test]
    fn test_acquire_carries_forward_descriptor() {
        let forward = MixerForward {
            socket: Endpoint::udp("127.0.0.1", 41234),
            ssrc: 0xDEAD_BEEF,
            payload_type: 100,
        };

        let msg = mixer_acquire("alpha", &forward);
        assert_eq!(msg.event, EVENT_ACQUIRE);
        assert_eq!(msg.parameter_str("user"), Some("alpha"));

        let sent: MixerForward = serde_json::from_value(
            msg.parameter.as_ref().unwrap()["forward"].clone(),
        )
        .unwrap();
        assert_eq!(sent, forward);
    }

    #[test]
    fn test_join_carries_loop_data() {
        let data = LoopData {
            name: "alpha".to_string(),
            socket: Endpoint::udp("224.0.0.7", 5000),
            volume: 4,
        };

        let msg = mixer_join(&data);
        assert_eq!(msg.event, EVENT_JOIN);

        let sent: LoopData =
            serde_json::from_value(msg.parameter.as_ref().unwrap()["loop"].clone()).unwrap();
        assert_eq!(sent, data);
    }

    #[test]
    fn test_fresh_uuids_per_message() {
        assert_ne!(register("a", "b").uuid, register("a", "b").uuid);
    }
}
