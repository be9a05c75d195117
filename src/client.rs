/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Engine-side client records: the per-client control block, the event
//! channel and the feed sets the graph sort runs on.

use crate::{
    engine::ProcessContext,
    error::{ProtocolError, ProtocolResult},
    formats::{CLIENT_EVENT_TIMEOUT_MS, ClientId, Frames, Uuid},
    protocol::{self, Event, LatencyMode},
    shm::{ClientControlShared, ClientControlShm},
    time::get_microseconds,
    transport::{Position, TransportState},
};
use serde::{Deserialize, Serialize};
use std::{
    io::Read,
    os::unix::{io::AsRawFd, net::UnixStream},
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Internal,
    Driver,
    External,
}

impl ClientType {
    pub fn to_u32(self) -> u32 {
        match self {
            ClientType::Internal => 0,
            ClientType::Driver => 1,
            ClientType::External => 2,
        }
    }
}

/// Hooks of an in-process client. Runs on the engine's threads: `process`
/// and the transport hooks on the RT cycle thread, everything else on the
/// server thread.
#[allow(unused_variables)]
pub trait InternalHandler: Send {
    fn process(&mut self, ctx: &mut ProcessContext) -> i32 {
        0
    }

    fn buffer_size(&mut self, nframes: Frames) -> i32 {
        0
    }

    fn sample_rate(&mut self, nframes: Frames) -> i32 {
        0
    }

    fn latency(&mut self, mode: LatencyMode) {}

    fn sync(&mut self, state: TransportState, position: &Position) -> bool {
        true
    }

    fn timebase(
        &mut self,
        state: TransportState,
        nframes: Frames,
        position: &mut Position,
        new_pos: bool,
    ) {
    }

    /// Every event that is not covered by one of the dedicated hooks.
    fn notification(&mut self, event: &Event) {}
}

/// Where a client's control block lives: shm for external clients, heap
/// for internal and driver clients.
pub enum ClientControlHandle {
    Shm(ClientControlShm),
    Heap(Box<ClientControlShared>),
}

impl ClientControlHandle {
    pub fn control(&self) -> &ClientControlShared {
        match self {
            ClientControlHandle::Shm(shm) => shm.control(),
            ClientControlHandle::Heap(control) => control,
        }
    }
}

/// Lifecycle state tracked next to the shared `active`/`dead` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Allocated,
    Active,
    Dead,
}

pub struct ClientInternal {
    pub id: ClientId,
    pub uuid: Uuid,
    pub name: String,
    pub ctype: ClientType,
    pub control: ClientControlHandle,
    pub shm_id: Option<String>,
    pub lifecycle: Lifecycle,
    /// In-process hooks; `None` for external clients.
    pub handler: Option<Mutex<Box<dyn InternalHandler>>>,
    /// Push side of the event channel; `None` for in-process clients.
    pub event_stream: Option<Mutex<UnixStream>>,
    /// Error weight accumulated from failed acks, timeouts and bad
    /// process returns. Written from the RT path, hence atomic.
    pub error: AtomicU32,
    pub session_reply_pending: bool,
    /// Clients this one feeds for sorting purposes; feedback edges appear
    /// reversed. One entry per connection, so parallel edges refcount.
    pub sortfeeds: Vec<ClientId>,
    /// Actual downstream clients, feedback edges included.
    pub truefeeds: Vec<ClientId>,
    pub fedcount: i32,
    /// Scratch counter of the acyclic check.
    pub tfedcount: i32,
    pub execution_order: u32,
    pub subgraph_start_fifo: Option<u32>,
    pub subgraph_wait_fifo: Option<u32>,
    /// PortRegistered events held back until activation.
    pub deferred_port_events: Vec<Event>,
}

impl ClientInternal {
    pub fn control(&self) -> &ClientControlShared {
        self.control.control()
    }

    pub fn error_count(&self) -> u32 {
        self.error.load(Ordering::Relaxed)
    }

    pub fn add_error(&self, weight: u32) {
        self.error.fetch_add(weight, Ordering::Relaxed);
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.ctype, ClientType::Internal | ClientType::Driver)
    }

    pub fn is_driver(&self) -> bool {
        self.ctype == ClientType::Driver
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active && !self.control().is_dead()
    }

    pub fn has_process_chain(&self) -> bool {
        self.control().has_callback(protocol::callback_bits::PROCESS)
            || self.control().has_callback(protocol::callback_bits::THREAD)
    }

    pub fn remove_sortfeed(&mut self, target: ClientId) {
        if let Some(pos) = self.sortfeeds.iter().position(|c| *c == target) {
            self.sortfeeds.swap_remove(pos);
        }
    }

    pub fn remove_truefeed(&mut self, target: ClientId) {
        if let Some(pos) = self.truefeeds.iter().position(|c| *c == target) {
            self.truefeeds.swap_remove(pos);
        }
    }

    /// Delivers one event to this client and waits for the ack. For
    /// in-process clients this is a direct dispatch; for external clients
    /// the event goes out on the event socket and the client answers with
    /// a one-byte status.
    pub fn deliver_event(&self, event: &Event) -> ProtocolResult<()> {
        if self.control().is_dead() {
            return Ok(());
        }
        match (&self.handler, &self.event_stream) {
            (Some(handler), _) => {
                let mut handler = handler.lock().expect("handler lock poisoned");
                dispatch_local(handler.as_mut(), self.control(), event);
                Ok(())
            }
            (None, Some(stream)) => {
                let mut stream = stream.lock().expect("event stream lock poisoned");
                protocol::write_frame_blocking(&mut *stream, event)?;
                read_event_ack(&mut stream)
            }
            (None, None) => Ok(()),
        }
    }
}

/// Maps an event onto the matching in-process hook.
pub fn dispatch_local(
    handler: &mut dyn InternalHandler,
    control: &ClientControlShared,
    event: &Event,
) {
    use crate::protocol::callback_bits as cb;
    match event {
        Event::BufferSizeChange { nframes } => {
            if control.has_callback(cb::BUFFER_SIZE) {
                handler.buffer_size(*nframes);
            }
        }
        Event::SampleRateChange { nframes } => {
            if control.has_callback(cb::SAMPLE_RATE) {
                handler.sample_rate(*nframes);
            }
        }
        Event::LatencyCallback { mode } => {
            if control.has_callback(cb::LATENCY) {
                handler.latency(*mode);
            }
        }
        other => handler.notification(other),
    }
}

/// Waits for the one-byte event ack with the configured timeout.
/// Spurious poll wakeups are detected by measuring elapsed monotonic time
/// and re-polling with the remainder instead of treating the wakeup as a
/// timeout.
fn read_event_ack(stream: &mut UnixStream) -> ProtocolResult<()> {
    let fd = stream.as_raw_fd();
    let deadline_usecs = CLIENT_EVENT_TIMEOUT_MS * 1_000;
    let start = get_microseconds();
    let mut remaining_usecs = deadline_usecs;

    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL,
            revents: 0,
        };
        let timeout_ms = 1 + (remaining_usecs / 1_000) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if pfd.revents & libc::POLLIN != 0 {
            let mut status = [0u8; 1];
            let n = stream.read(&mut status)?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            if status[0] != 0 {
                return Err(ProtocolError::AckStatus(status[0] as i32));
            }
            return Ok(());
        }

        // no events, no error: poll decided time was up
        let elapsed = get_microseconds().saturating_sub(start);
        if elapsed < deadline_usecs {
            debug!(
                "false wakeup on event ack ({} of {} usecs elapsed)",
                elapsed, deadline_usecs
            );
            remaining_usecs = deadline_usecs - elapsed;
            continue;
        }
        warn!("event ack timed out");
        return Err(ProtocolError::AckTimeout);
    }
}

/// A client name must fit the fixed-size control block field, may not
/// contain the port separator and may not look like a port id.
pub fn validate_client_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < crate::formats::CLIENT_NAME_SIZE
        && !name.contains(':')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Generates `name-NN` alternatives until one is free. Two digits, then
/// we give up, like the reference behavior.
pub fn generate_unique_name(
    name: &str,
    taken: impl Fn(&str) -> bool,
) -> Option<String> {
    if !taken(name) {
        return Some(name.to_owned());
    }
    for n in 1..100u32 {
        let candidate = format!("{name}-{n:02}");
        if candidate.len() < crate::formats::CLIENT_NAME_SIZE && !taken(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_name_validation_works() {
        assert!(validate_client_name("pass"));
        assert!(validate_client_name("Pass Through 2"));
        assert!(!validate_client_name(""));
        assert!(!validate_client_name("a:b"));
        assert!(!validate_client_name("2pac"));
        assert!(!validate_client_name(&"x".repeat(100)));
    }

    #[test]
    fn unique_names_get_two_digit_suffixes() {
        let taken = ["pass".to_owned(), "pass-01".to_owned()];
        let name =
            generate_unique_name("pass", |n| taken.iter().any(|t| t == n)).expect("no name");
        assert_eq!(name, "pass-02");
    }

    #[test]
    fn unique_name_generation_gives_up_eventually() {
        let name = generate_unique_name("pass", |_| true);
        assert!(name.is_none());
    }
}
