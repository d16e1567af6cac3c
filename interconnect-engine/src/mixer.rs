//! Mixer registry and mixer-facing data types
//!
//! Mixers attach over the mixer listener, register themselves and are then
//! handed one reserved user per loop through the acquire/join exchange. The
//! registry only tracks attachment and reservations; the mixer process
//! itself is an external collaborator.
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


use loopgrid_types::Endpoint;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::debug;

/// Users one mixer can serve at most
pub const DEFAULT_MIXER_CAPACITY: usize = 16;

/// Forward descriptor sent with `acquire`: where the mixer shall send the
/// loop's mixed stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MixerForward {
    /// Loop receive socket on the loopback interface
    pub socket: Endpoint,
    /// SSRC the mixer stamps on its egress
    pub ssrc: u32,
    /// RTP payload type of the forwarded stream
    pub payload_type: u8,
}

/// Loop description sent with `join`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopData {
    pub name: String,
    /// Multicast endpoint of the loop
    pub socket: Endpoint,
    /// Playback volume on the mixer's 3-bit scale
    pub volume: u8,
}

/// Percent volume mapped onto an n-bit scale, rounded
pub fn volume_from_percent(percent: u8, bits: u8) -> u8 {
    let max = (1u16 << bits) - 1;
    ((percent.min(100) as u16 * max + 50) / 100) as u8
}

/// A reserved mixer slot: the mixer's control connection and the user id
/// reserved on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerData {
    pub remote: SocketAddr,
    pub user: String,
}

#[derive(Debug)]
struct MixerEntry {
    users: HashSet<String>,
    capacity: usize,
}

/// Pool of attached mixers
#[derive(Debug, Default)]
pub struct MixerRegistry {
    mixers: HashMap<SocketAddr, MixerEntry>,
}

impl MixerRegistry {
    pub fn new() -> Self {
        MixerRegistry::default()
    }

    /// Track a mixer that registered on the mixer listener
    pub fn register_mixer(&mut self, remote: SocketAddr) {
        self.mixers.entry(remote).or_insert_with(|| MixerEntry {
            users: HashSet::new(),
            capacity: DEFAULT_MIXER_CAPACITY,
        });
        debug!(%remote, "registered mixer");
    }

    /// Drop a mixer; every user reserved on it is released
    pub fn unregister_mixer(&mut self, remote: &SocketAddr) -> Vec<String> {
        match self.mixers.remove(remote) {
            Some(entry) => entry.users.into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, remote: &SocketAddr) -> bool {
        self.mixers.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.mixers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mixers.is_empty()
    }

    /// Reserve a user named after the loop on a mixer with spare capacity
    pub fn acquire_user(&mut self, name: &str) -> Option<MixerData> {
        let (remote, entry) = self
            .mixers
            .iter_mut()
            .find(|(_, entry)| entry.users.len() < entry.capacity)?;

        entry.users.insert(name.to_string());
        Some(MixerData {
            remote: *remote,
            user: name.to_string(),
        })
    }

    /// Give a reservation back without dropping the mixer
    pub fn release_user(&mut self, remote: &SocketAddr, user: &str) {
        if let Some(entry) = self.mixers.get_mut(remote) {
            entry.users.remove(user);
        }
    }
}
