//! Datagram channel between a session's DTLS stack and the media socket
//!
//! OpenSSL drives a byte stream; the media path is datagrams on one shared
//! UDP socket. This adapter sits in between: inbound datagrams are queued
//! and handed to the stack on `read`, records the stack emits on `write`
//! are queued for the session to drain and send to its remote media tuple.
//! The control flow is always "feed bytes in, drive the handshake or read,
//! drain the outbound queue".
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


use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ChannelState {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Shared handle; one clone lives inside the `SslStream`, the session keeps
/// the other to feed and drain it.
#[derive(Debug, Clone, Default)]
pub struct DatagramChannel {
    inner: Arc<Mutex<ChannelState>>,
}

impl DatagramChannel {
    pub fn new() -> Self {
        DatagramChannel::default()
    }

    /// Queue one inbound datagram for the DTLS stack
    pub fn push_datagram(&self, buffer: &[u8]) {
        let mut state = self.inner.lock().unwrap();
        if !state.closed {
            state.inbound.push_back(buffer.to_vec());
        }
    }

    /// Take every outbound record the stack has produced since the last
    /// drain. Each entry is sent as one datagram.
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut state = self.inner.lock().unwrap();
        state.outbound.drain(..).collect()
    }

    /// Mark the channel dead; reads report EOF, writes report broken pipe
    pub fn close(&self) {
        let mut state = self.inner.lock().unwrap();
        state.closed = true;
        state.inbound.clear();
        state.outbound.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Read for DatagramChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().unwrap();

        match state.inbound.pop_front() {
            Some(datagram) => {
                // One datagram per read; DTLS records never span datagrams
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            None if state.closed => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for DatagramChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().unwrap();

        if state.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        // Writes of any length succeed in full
        state.outbound.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
