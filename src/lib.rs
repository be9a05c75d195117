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

//! A low-latency audio connection kit: an engine that schedules a
//! directed graph of audio/MIDI clients in hard real-time against a
//! backend driver, plus the client library that connects to it.

pub mod api;
pub mod client;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fifo;
pub mod formats;
pub mod graph;
pub mod latency;
pub mod metadata;
pub mod observability;
pub mod port;
pub mod protocol;
pub mod server;
pub mod shm;
pub mod time;
pub mod transport;
