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

use crate::formats::{Frames, PortId};
use miette::Diagnostic;
use shared_memory::ShmemError;
use std::io;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("Tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ShmError {
    #[error("Shared memory error: {0}")]
    SharedMemoryError(#[from] ShmemError),
    #[error("Shared memory segment too small: have {have} bytes, need {need}")]
    SegmentTooSmall { have: usize, need: usize },
    #[error("Shared memory segment '{0}' carries a foreign layout")]
    BadMagic(String),
}

pub type ShmResult<T> = Result<T, ShmError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("Protocol version mismatch: engine speaks {engine}, client speaks {client}")]
    VersionMismatch { engine: u32, client: u32 },
    #[error("Oversized protocol frame: {0} bytes")]
    OversizedFrame(u32),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Event was not acknowledged in time")]
    AckTimeout,
    #[error("Event acknowledged with error status {0}")]
    AckStatus(i32),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Shared memory error: {0}")]
    ShmError(#[from] ShmError),
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("Driver error: {0}")]
    DriverError(#[from] DriverError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Unknown client {0}")]
    UnknownClient(String),
    #[error("Client name '{0}' is not unique")]
    NameNotUnique(String),
    #[error("Invalid client name '{0}'")]
    InvalidClientName(String),
    #[error("Client '{0}' is not active")]
    ClientNotActive(String),
    #[error("Unknown port '{0}'")]
    UnknownPort(String),
    #[error("Unknown port id {0}")]
    UnknownPortId(PortId),
    #[error("Port name '{0}' is already in use")]
    PortNameTaken(String),
    #[error("Port name '{0}' is too long")]
    PortNameTooLong(String),
    #[error("Invalid flags for port '{0}': exactly one of Input|Output must be set")]
    InvalidPortFlags(String),
    #[error("Unknown port type '{0}'")]
    UnknownPortType(String),
    #[error("All {0} ports are in use")]
    PortRegistryFull(u32),
    #[error("Ports '{0}' and '{1}' already connected")]
    AlreadyConnected(String, String),
    #[error("Ports '{0}' and '{1}' are not connected")]
    NotConnected(String, String),
    #[error("Cannot connect '{0}' to '{1}': incompatible ports")]
    IncompatiblePorts(String, String),
    #[error("Port type '{0}' does not support multiple connections")]
    NoMixdown(String),
    #[error("Buffer size {0} is not a power of two")]
    BufferSizeNotPowerOfTwo(Frames),
    #[error("Buffer size {0} is out of range")]
    BufferSizeOutOfRange(Frames),
    #[error("A timebase master is already registered")]
    TimebaseMasterExists,
    #[error("Client is not the timebase master")]
    NotTimebaseMaster,
    #[error("Engine is shutting down")]
    ShuttingDown,
    #[error("Internal client load failed: {0}")]
    IntClientLoadFailed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug, Diagnostic)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Driver cannot start: {0}")]
    StartFailed(String),
    #[error("Driver wait failed: {0}")]
    WaitFailed(String),
    #[error("Driver read failed: {0}")]
    ReadFailed(String),
    #[error("Driver write failed: {0}")]
    WriteFailed(String),
    #[error("Driver does not support buffer size {0}")]
    UnsupportedBufferSize(Frames),
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),
    #[error("Shared memory error: {0}")]
    ShmError(#[from] ShmError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("No JACK server running at '{0}'")]
    ServerNotRunning(String),
    #[error("Server refused client: {0:?}")]
    OpenFailed(crate::protocol::ClientStatus),
    #[error("Client is not active")]
    NotActive,
    #[error("Client has been zombified by the server")]
    Zombified,
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Unknown port '{0}'")]
    UnknownPort(String),
    #[error("A process handler is already registered")]
    ProcessHandlerTaken,
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug, Diagnostic)]
#[error("System clock error: {0}")]
pub struct SystemClockError(pub String);

pub type SystemClockResult<T> = Result<T, SystemClockError>;
