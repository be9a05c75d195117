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

//! Wire format of the two per-client Unix sockets: the request socket
//! (client → engine, synchronous request/response) and the event socket
//! (engine → client, push events with a one-byte ack). Frames are
//! length-prefixed JSON; the data plane never touches these sockets.

use crate::{
    error::{ProtocolError, ProtocolResult},
    formats::{ClientId, Frames, PortId, PortTypeId, SampleRate, Usecs, Uuid},
    metadata::PropertyChangeKind,
    transport::Position,
};
use bitflags::bitflags;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control frames stay small; anything bigger is a protocol violation.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024;

bitflags! {
    #[derive(Default)]
    pub struct ClientOptions: u32 {
        const NO_START_SERVER = 0x01;
        const USE_EXACT_NAME = 0x02;
        const SERVER_NAME = 0x04;
        const LOAD_NAME = 0x08;
        const LOAD_INIT = 0x10;
        const SESSION_ID = 0x20;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct ClientStatus: u32 {
        const FAILURE = 0x01;
        const INVALID_OPTION = 0x02;
        const NAME_NOT_UNIQUE = 0x04;
        const SERVER_STARTED = 0x08;
        const SERVER_FAILED = 0x10;
        const SERVER_ERROR = 0x20;
        const NO_SUCH_CLIENT = 0x40;
        const LOAD_FAILURE = 0x80;
        const INIT_FAILURE = 0x100;
        const SHM_FAILURE = 0x200;
        const VERSION_ERROR = 0x400;
        const BACKEND_ERROR = 0x800;
        const CLIENT_ZOMBIE = 0x1000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct PortFlags: u32 {
        const IS_INPUT = 0x01;
        const IS_OUTPUT = 0x02;
        const IS_PHYSICAL = 0x04;
        const CAN_MONITOR = 0x08;
        const IS_TERMINAL = 0x10;
    }
}

macro_rules! serde_bits {
    ($flags:ty) => {
        impl Serialize for $flags {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $flags {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let bits = u32::deserialize(deserializer)?;
                Ok(<$flags>::from_bits_truncate(bits))
            }
        }
    };
}

serde_bits!(ClientOptions);
serde_bits!(ClientStatus);
serde_bits!(PortFlags);

/// Callback-presence bits in the client control block, consulted wait-free
/// on the RT path and updated only under the graph write lock.
pub mod callback_bits {
    pub const PROCESS: u32 = 0x1;
    pub const THREAD: u32 = 0x2;
    pub const THREAD_INIT: u32 = 0x4;
    pub const BUFFER_SIZE: u32 = 0x8;
    pub const SAMPLE_RATE: u32 = 0x10;
    pub const XRUN: u32 = 0x20;
    pub const PORT_CONNECT: u32 = 0x40;
    pub const PORT_REGISTER: u32 = 0x80;
    pub const CLIENT_REGISTER: u32 = 0x100;
    pub const GRAPH_ORDER: u32 = 0x200;
    pub const FREEWHEEL: u32 = 0x400;
    pub const SYNC: u32 = 0x800;
    pub const TIMEBASE: u32 = 0x1000;
    pub const SESSION: u32 = 0x2000;
    pub const LATENCY: u32 = 0x4000;
    pub const PROPERTY: u32 = 0x8000;
    pub const PORT_RENAME: u32 = 0x10000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyMode {
    Capture,
    Playback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LatencyRange {
    pub min: Frames,
    pub max: Frames,
}

/// First frame on a fresh request socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOpen {
    pub protocol_version: u32,
    pub name: String,
    pub options: ClientOptions,
    pub uuid: Option<Uuid>,
    pub session_id: Option<String>,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOpenReply {
    pub status: ClientStatus,
    pub client_id: ClientId,
    pub uuid: Uuid,
    /// Assigned name; differs from the requested one when a unique suffix
    /// was generated.
    pub name: String,
    pub engine_pid: u32,
    pub port_max: u32,
    pub control_shm_id: String,
    pub client_shm_id: String,
    pub fifo_prefix: String,
    pub client_rt_priority: i32,
    pub realtime: bool,
}

/// First frame on a fresh event socket, pairs it with the request socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHello {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    RegisterPort {
        client_id: ClientId,
        short_name: String,
        type_name: String,
        flags: PortFlags,
        buffer_size_hint: u32,
    },
    UnregisterPort {
        client_id: ClientId,
        port_id: PortId,
    },
    ConnectPorts {
        source: String,
        destination: String,
    },
    DisconnectPorts {
        source: String,
        destination: String,
    },
    DisconnectPort {
        port_id: PortId,
    },
    RenamePort {
        client_id: ClientId,
        port_id: PortId,
        short_name: String,
    },
    SetPortAlias {
        port_id: PortId,
        alias: String,
    },
    ActivateClient {
        client_id: ClientId,
    },
    DeactivateClient {
        client_id: ClientId,
    },
    SetTimebaseClient {
        client_id: ClientId,
        conditional: bool,
    },
    ResetTimebaseClient {
        client_id: ClientId,
    },
    SetSyncClient {
        client_id: ClientId,
    },
    ResetSyncClient {
        client_id: ClientId,
    },
    SetSyncTimeout {
        usecs: Usecs,
    },
    SetBufferSize {
        nframes: Frames,
    },
    TransportStart,
    TransportStop,
    TransportLocate {
        frame: Frames,
    },
    TransportReposition {
        position: Position,
    },
    Freewheel {
        client_id: ClientId,
    },
    StopFreewheel {
        client_id: ClientId,
    },
    IntClientHandle {
        name: String,
    },
    IntClientLoad {
        name: String,
        path: String,
        init: String,
    },
    IntClientName {
        int_client_id: ClientId,
    },
    IntClientUnload {
        int_client_id: ClientId,
    },
    RecomputeTotalLatencies,
    RecomputeTotalLatency {
        port_id: PortId,
    },
    SessionNotify {
        target: Option<String>,
        save_path: String,
    },
    SessionReply {
        client_id: ClientId,
    },
    SessionHasCallback {
        client_id: ClientId,
    },
    GetPortConnections {
        port_id: PortId,
    },
    GetPortNConnections {
        port_id: PortId,
    },
    GetClientByUuid {
        uuid: Uuid,
    },
    GetUuidByClientName {
        name: String,
    },
    ReserveName {
        name: String,
        uuid: Uuid,
    },
    PropertyChangeNotify {
        subject: Uuid,
        key: Option<String>,
        change: PropertyChangeKind,
    },
    SetClientCapabilities {
        client_id: ClientId,
    },
    SetProperty {
        subject: Uuid,
        key: String,
        value: String,
        value_type: Option<String>,
    },
    GetProperty {
        subject: Uuid,
        key: String,
    },
    GetProperties {
        subject: Uuid,
    },
    GetAllProperties,
    RemoveProperty {
        subject: Uuid,
        key: String,
    },
    RemoveProperties {
        subject: Uuid,
    },
    RemoveAllProperties,
    CloseClient {
        client_id: ClientId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    /// `code` carries an errno-style discriminator (EEXIST, EINVAL,
    /// ERANGE) where the operation defines one, 0 otherwise.
    Error {
        code: i32,
        message: String,
    },
    PortId(PortId),
    Connections(Vec<String>),
    NConnections(u32),
    ClientName(String),
    ClientUuid(Uuid),
    IntClient {
        int_client_id: ClientId,
        status: ClientStatus,
    },
    HasCallback(bool),
    Property(Option<crate::metadata::Property>),
    Properties(Vec<crate::metadata::Property>),
    RemovedCount(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    BufferSizeChange {
        nframes: Frames,
    },
    SampleRateChange {
        nframes: SampleRate,
    },
    AttachPortSegment {
        ptype_id: PortTypeId,
        shm_id: String,
        buffer_bytes: u32,
    },
    PortConnected {
        source: PortId,
        destination: PortId,
    },
    PortDisconnected {
        source: PortId,
        destination: PortId,
    },
    GraphReordered {
        fifo_index: u32,
        upstream_is_engine: bool,
    },
    PortRegistered {
        port_id: PortId,
    },
    PortUnregistered {
        port_id: PortId,
    },
    PortRename {
        port_id: PortId,
        old_name: String,
        new_name: String,
    },
    XRun,
    StartFreewheel,
    StopFreewheel,
    ClientRegistered {
        name: String,
        uuid: Uuid,
    },
    ClientUnregistered {
        name: String,
        uuid: Uuid,
    },
    SaveSession {
        path: String,
    },
    LatencyCallback {
        mode: LatencyMode,
    },
    PropertyChange {
        subject: Uuid,
        key: Option<String>,
        change: PropertyChangeKind,
    },
    Shutdown {
        status: ClientStatus,
        reason: String,
    },
}

fn encode<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::OversizedFrame(len));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_len(header: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::OversizedFrame(len));
    }
    Ok(len as usize)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> ProtocolResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Err(e.into())
        };
    }
    let len = decode_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn write_frame_blocking<W, T>(writer: &mut W, message: &T) -> ProtocolResult<()>
where
    W: Write,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame_blocking<R, T>(reader: &mut R) -> ProtocolResult<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header) {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Err(e.into())
        };
    }
    let len = decode_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip_works() {
        let request = Request::ConnectPorts {
            source: "system:capture_1".to_owned(),
            destination: "pass:in".to_owned(),
        };
        let frame = encode(&request).expect("encode failed");
        let mut reader = std::io::Cursor::new(frame);
        let decoded: Request = read_frame_blocking(&mut reader).expect("decode failed");
        match decoded {
            Request::ConnectPorts {
                source,
                destination,
            } => {
                assert_eq!(source, "system:capture_1");
                assert_eq!(destination, "pass:in");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut header = [0u8; 4];
        header.copy_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        assert!(decode_len(header).is_err());
    }

    #[test]
    fn status_bits_survive_serde() {
        let status = ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE;
        let json = serde_json::to_string(&status).expect("serialize failed");
        let back: ClientStatus = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(status, back);
    }

    #[test]
    fn port_flags_are_exclusive_directions() {
        let flags = PortFlags::IS_INPUT;
        assert!(!flags.contains(PortFlags::IS_OUTPUT));
    }
}
