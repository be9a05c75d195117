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

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Frames within a single period. Wraps per JACK convention.
pub type Frames = u32;
/// Running frame counter, monotonic for the lifetime of the engine.
pub type FrameTime = u64;
pub type SampleRate = u32;
/// Microseconds on the engine's monotonic clock.
pub type Usecs = u64;

pub type PortId = u32;
pub type ClientId = u32;
pub type PortTypeId = u32;
pub type ConnectionId = u32;

pub const CLIENT_NAME_SIZE: usize = 64;
pub const PORT_NAME_SIZE: usize = 256;
pub const PORT_TYPE_NAME_SIZE: usize = 32;

pub const DEFAULT_PORT_MAX: u32 = 256;
pub const PORT_TYPES_MAX: usize = 4;

pub const MIN_BUFFER_SIZE: Frames = 1;
pub const MAX_BUFFER_SIZE: Frames = 16384;

/// Fixed per-port buffer size for port types with a negative scale factor.
pub const FIXED_BUFFER_SIZE: usize = 8192;

pub const AUDIO_TYPE_NAME: &str = "32 bit float mono audio";
pub const MIDI_TYPE_NAME: &str = "8 bit raw midi";

/// Number of cycle execution times kept for cpu load estimation.
pub const ENGINE_ROLLING_COUNT: usize = 32;
pub const ENGINE_ROLLING_INTERVAL: usize = 32;

/// Maximum hops when walking connections for total latency, bottoms out
/// accidental cycles.
pub const MAX_LATENCY_HOPS: u32 = 8;

pub const CLIENT_EVENT_TIMEOUT_MS: u64 = 2_000;
pub const FREEWHEEL_POLL_TIMEOUT_USECS: Usecs = 250_000;
pub const WATCHDOG_TIMEOUT_MS: u64 = 10_000;

/// A failed event ack counts this much towards removal.
pub const SOCKET_ERROR_WEIGHT: u32 = 100;
/// Error count at which a client is removed instead of zombified.
pub const ERROR_REMOVE_THRESHOLD: u32 = 100;

pub const MAX_CONSECUTIVE_EXCESSIVE_DELAYS: u32 = 10;
pub const WORK_SCALE: f32 = 1.0;

/// Bumped whenever the request or event wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

pub fn period_usecs(buffer_size: Frames, sample_rate: SampleRate) -> f32 {
    (buffer_size as f32 / sample_rate as f32) * 1_000_000.0
}

pub fn frames_to_usecs(frames: FrameTime, sample_rate: SampleRate) -> Usecs {
    (frames * 1_000_000) / sample_rate as u64
}

/// 128 bit identifier for clients and ports. Unique per engine run, stable
/// for the lifetime of the subject, and the key under which metadata is
/// stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Uuid(pub u128);

impl Uuid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Uuid(u128::from_le_bytes(bytes))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(u128::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::str::FromStr for Uuid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Uuid(u128::from_str_radix(s, 16)?))
    }
}

/// Copies `s` into a fixed-size NUL-padded buffer, truncating at `N - 1`.
pub fn to_fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

pub fn from_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn period_usecs_works() {
        assert_eq!(period_usecs(128, 48_000).round() as u32, 2_667);
        assert_eq!(period_usecs(1024, 48_000).round() as u32, 21_333);
    }

    #[test]
    fn fixed_str_round_trip_works() {
        let buf = to_fixed_str::<64>("system:capture_1");
        assert_eq!(from_fixed_str(&buf), "system:capture_1");
    }

    #[test]
    fn fixed_str_truncates() {
        let long = "x".repeat(100);
        let buf = to_fixed_str::<64>(&long);
        assert_eq!(from_fixed_str(&buf).len(), 63);
    }

    #[test]
    fn uuid_string_round_trip_works() {
        let uuid = Uuid::generate();
        let parsed: Uuid = uuid.to_string().parse().expect("parse failed");
        assert_eq!(uuid, parsed);
    }
}
