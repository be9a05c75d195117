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

//! The transport state machine. Runs at cycle end on the engine's RT
//! thread; commands and locates arrive from the server thread and are
//! applied before the next cycle begins.

use crate::{
    error::{EngineError, EngineResult},
    formats::{ClientId, FrameTime, Frames, SampleRate, Usecs},
    shm::TransportShared,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::atomic::Ordering,
};
use tracing::{debug, info};

pub const DEFAULT_SYNC_TIMEOUT_USECS: Usecs = 2_000_000;

/// Position valid bits.
pub mod position_bits {
    pub const BBT: u32 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Rolling,
    Looping,
    Starting,
}

impl TransportState {
    pub fn to_u32(self) -> u32 {
        match self {
            TransportState::Stopped => 0,
            TransportState::Rolling => 1,
            TransportState::Looping => 2,
            TransportState::Starting => 3,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => TransportState::Rolling,
            2 => TransportState::Looping,
            3 => TransportState::Starting,
            _ => TransportState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    /// Monotonically increasing sequence number, disambiguates races
    /// between concurrent reposition requests.
    pub unique: u64,
    pub usecs: Usecs,
    pub frame_rate: SampleRate,
    pub frame: Frames,
    pub valid: u32,
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

impl Position {
    pub fn publish(&self, state: TransportState, shared: &TransportShared) {
        shared.begin_write();
        shared.state.store(state.to_u32(), Ordering::Relaxed);
        shared.frame.store(self.frame.into(), Ordering::Relaxed);
        shared.frame_rate.store(self.frame_rate, Ordering::Relaxed);
        shared.usecs.store(self.usecs, Ordering::Relaxed);
        shared.valid.store(self.valid, Ordering::Relaxed);
        shared.bar.store(self.bar, Ordering::Relaxed);
        shared.beat.store(self.beat, Ordering::Relaxed);
        shared.tick.store(self.tick, Ordering::Relaxed);
        shared
            .bar_start_tick
            .store(self.bar_start_tick.to_bits(), Ordering::Relaxed);
        shared
            .beats_per_bar
            .store(self.beats_per_bar.to_bits(), Ordering::Relaxed);
        shared
            .beat_type
            .store(self.beat_type.to_bits(), Ordering::Relaxed);
        shared
            .ticks_per_beat
            .store(self.ticks_per_beat.to_bits(), Ordering::Relaxed);
        shared
            .beats_per_minute
            .store(self.beats_per_minute.to_bits(), Ordering::Relaxed);
        shared.unique.store(self.unique, Ordering::Relaxed);
        shared.end_write();
    }

    pub fn snapshot(shared: &TransportShared) -> (TransportState, Position) {
        shared.read_consistent(|s| {
            (
                TransportState::from_u32(s.state.load(Ordering::Relaxed)),
                Position {
                    unique: s.unique.load(Ordering::Relaxed),
                    usecs: s.usecs.load(Ordering::Relaxed),
                    frame_rate: s.frame_rate.load(Ordering::Relaxed),
                    frame: s.frame.load(Ordering::Relaxed) as Frames,
                    valid: s.valid.load(Ordering::Relaxed),
                    bar: s.bar.load(Ordering::Relaxed),
                    beat: s.beat.load(Ordering::Relaxed),
                    tick: s.tick.load(Ordering::Relaxed),
                    bar_start_tick: f64::from_bits(s.bar_start_tick.load(Ordering::Relaxed)),
                    beats_per_bar: f32::from_bits(s.beats_per_bar.load(Ordering::Relaxed)),
                    beat_type: f32::from_bits(s.beat_type.load(Ordering::Relaxed)),
                    ticks_per_beat: f64::from_bits(s.ticks_per_beat.load(Ordering::Relaxed)),
                    beats_per_minute: f64::from_bits(s.beats_per_minute.load(Ordering::Relaxed)),
                },
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportCommand {
    Start,
    Stop,
}

/// Engine-private transport bookkeeping. Mutated by the server thread
/// under the graph write lock (role changes, commands) and read/advanced
/// by the cycle executor at cycle end.
#[derive(Debug)]
pub struct TransportEngine {
    state: TransportState,
    current: Position,
    pending_locate: Option<Position>,
    new_pos: bool,
    command: Option<TransportCommand>,
    master: Option<ClientId>,
    sync_clients: HashSet<ClientId>,
    sync_poll: HashSet<ClientId>,
    sync_time_left_usecs: Usecs,
    sync_timeout_usecs: Usecs,
    unique_counter: u64,
}

impl TransportEngine {
    pub fn new(sample_rate: SampleRate) -> Self {
        Self {
            state: TransportState::Stopped,
            current: Position {
                frame_rate: sample_rate,
                ..Position::default()
            },
            pending_locate: None,
            new_pos: false,
            command: None,
            master: None,
            sync_clients: HashSet::new(),
            sync_poll: HashSet::new(),
            sync_time_left_usecs: 0,
            sync_timeout_usecs: DEFAULT_SYNC_TIMEOUT_USECS,
            unique_counter: 0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn position(&self) -> Position {
        self.current
    }

    pub fn new_pos(&self) -> bool {
        self.new_pos
    }

    pub fn set_sample_rate(&mut self, sample_rate: SampleRate) {
        self.current.frame_rate = sample_rate;
    }

    pub fn start(&mut self) {
        self.command = Some(TransportCommand::Start);
    }

    pub fn stop(&mut self) {
        self.command = Some(TransportCommand::Stop);
    }

    /// Queues a locate for the next cycle. The engine accepts at most one
    /// pending locate per cycle; a later request before the cycle boundary
    /// supersedes the earlier one and gets the higher sequence number.
    pub fn locate(&mut self, frame: Frames) {
        let position = Position {
            frame,
            frame_rate: self.current.frame_rate,
            ..Position::default()
        };
        self.reposition(position);
    }

    pub fn reposition(&mut self, mut position: Position) {
        self.unique_counter += 1;
        position.unique = self.unique_counter;
        position.frame_rate = self.current.frame_rate;
        self.pending_locate = Some(position);
    }

    pub fn timebase_master(&self) -> Option<ClientId> {
        self.master
    }

    pub fn set_timebase_master(
        &mut self,
        client_id: ClientId,
        conditional: bool,
    ) -> EngineResult<()> {
        if conditional && self.master.is_some_and(|m| m != client_id) {
            return Err(EngineError::TimebaseMasterExists);
        }
        info!("Timebase master is now client {client_id}");
        self.master = Some(client_id);
        Ok(())
    }

    pub fn reset_timebase_master(&mut self, client_id: ClientId) -> EngineResult<()> {
        if self.master != Some(client_id) {
            return Err(EngineError::NotTimebaseMaster);
        }
        self.master = None;
        Ok(())
    }

    pub fn set_sync_client(&mut self, client_id: ClientId) {
        self.sync_clients.insert(client_id);
    }

    pub fn remove_sync_client(&mut self, client_id: ClientId) {
        self.sync_clients.remove(&client_id);
        self.sync_poll.remove(&client_id);
    }

    pub fn set_sync_timeout(&mut self, usecs: Usecs) {
        self.sync_timeout_usecs = usecs;
    }

    pub fn sync_poll_pending(&self, client_id: ClientId) -> bool {
        self.sync_poll.contains(&client_id)
    }

    /// Drops every role the departing client held.
    pub fn client_exit(&mut self, client_id: ClientId) {
        if self.master == Some(client_id) {
            self.master = None;
        }
        self.remove_sync_client(client_id);
    }

    /// The timebase master delivered a new BBT position for the frame the
    /// transport currently stands at.
    pub fn master_update(&mut self, position: Position) {
        let frame = self.current.frame;
        let frame_rate = self.current.frame_rate;
        let unique = self.current.unique;
        self.current = Position {
            frame,
            frame_rate,
            unique,
            ..position
        };
    }

    fn restart_sync_poll(&mut self) {
        self.sync_poll = self.sync_clients.clone();
        self.sync_time_left_usecs = self.sync_timeout_usecs;
    }

    /// One slow-sync client voted. `ready` mirrors the client's sync
    /// callback return value.
    pub fn sync_client_report(&mut self, client_id: ClientId, ready: bool) {
        if ready {
            self.sync_poll.remove(&client_id);
        }
    }

    /// Clients whose vote the barrier is still waiting for.
    pub fn pending_sync_clients(&self) -> Vec<ClientId> {
        self.sync_poll.iter().copied().collect()
    }

    /// Applies commands, locates and the state machine. Called at cycle
    /// end, before the frame counter of the next cycle is consumed.
    pub fn cycle_end(&mut self, nframes: Frames, period_usecs: f32, now_usecs: Usecs) {
        self.new_pos = false;

        if let Some(position) = self.pending_locate.take() {
            debug!("transport locate to frame {}", position.frame);
            self.current = position;
            self.new_pos = true;
            if !self.sync_clients.is_empty()
                && matches!(self.state, TransportState::Rolling | TransportState::Starting)
            {
                self.state = TransportState::Starting;
                self.restart_sync_poll();
            }
        }

        match self.command.take() {
            Some(TransportCommand::Start) => {
                if self.state == TransportState::Stopped {
                    self.state = TransportState::Starting;
                    self.new_pos = true;
                    self.restart_sync_poll();
                    info!("transport starting");
                }
            }
            Some(TransportCommand::Stop) => {
                if self.state != TransportState::Stopped {
                    self.state = TransportState::Stopped;
                    info!("transport stopped");
                }
            }
            None => {}
        }

        match self.state {
            TransportState::Starting => {
                let timed_out = self.sync_time_left_usecs < period_usecs as Usecs;
                if self.sync_poll.is_empty() || timed_out {
                    if timed_out && !self.sync_poll.is_empty() {
                        debug!(
                            "sync timeout with {} clients not ready",
                            self.sync_poll.len()
                        );
                        self.sync_poll.clear();
                    }
                    self.state = TransportState::Rolling;
                    info!("transport rolling");
                } else {
                    self.sync_time_left_usecs -= period_usecs as Usecs;
                }
            }
            TransportState::Rolling => {
                self.current.frame = self.current.frame.wrapping_add(nframes);
            }
            TransportState::Stopped | TransportState::Looping => {}
        }

        self.current.usecs = now_usecs;
    }

    pub fn publish(&self, shared: &TransportShared) {
        self.current.publish(self.state, shared);
    }

    /// Frame time the transport will report for the next cycle.
    pub fn frame(&self) -> FrameTime {
        self.current.frame as FrameTime
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PERIOD: f32 = 2_667.0;

    fn transport() -> TransportEngine {
        TransportEngine::new(48_000)
    }

    #[test]
    fn start_without_sync_clients_rolls_immediately() {
        let mut t = transport();
        t.start();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Rolling);
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.position().frame, 128);
    }

    #[test]
    fn stop_while_starting_returns_to_stopped() {
        let mut t = transport();
        t.set_sync_client(7);
        t.start();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Starting);
        t.stop();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Stopped);
    }

    #[test]
    fn slow_sync_barrier_holds_until_ready() {
        let mut t = transport();
        t.set_sync_client(1);
        t.set_sync_client(2);
        t.start();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Starting);

        t.sync_client_report(1, true);
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Starting);

        t.sync_client_report(2, true);
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Rolling);
    }

    #[test]
    fn sync_timeout_forces_rolling() {
        let mut t = transport();
        t.set_sync_client(1);
        t.set_sync_timeout(3 * PERIOD as Usecs);
        t.start();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Starting);
        for _ in 0..4 {
            t.cycle_end(128, PERIOD, 0);
        }
        assert_eq!(t.state(), TransportState::Rolling);
    }

    #[test]
    fn locate_is_applied_at_cycle_boundary() {
        let mut t = transport();
        t.start();
        t.cycle_end(128, PERIOD, 0);
        t.locate(96_000);
        assert_eq!(t.position().frame, 0);
        t.cycle_end(128, PERIOD, 0);
        assert!(t.new_pos());
        assert_eq!(t.position().frame, 96_000 + 128);
    }

    #[test]
    fn later_locate_supersedes_earlier_one() {
        let mut t = transport();
        t.locate(1_000);
        t.locate(2_000);
        t.cycle_end(0, PERIOD, 0);
        assert_eq!(t.position().frame, 2_000);
        assert_eq!(t.position().unique, 2);
    }

    #[test]
    fn conditional_timebase_master_fails_when_taken() {
        let mut t = transport();
        t.set_timebase_master(1, true).expect("first master");
        assert!(t.set_timebase_master(2, true).is_err());
        assert_eq!(t.timebase_master(), Some(1));
        t.set_timebase_master(2, false).expect("unconditional");
        assert_eq!(t.timebase_master(), Some(2));
    }

    #[test]
    fn client_exit_clears_roles() {
        let mut t = transport();
        t.set_timebase_master(1, false).expect("master");
        t.set_sync_client(1);
        t.client_exit(1);
        assert_eq!(t.timebase_master(), None);
        t.start();
        t.cycle_end(128, PERIOD, 0);
        assert_eq!(t.state(), TransportState::Rolling);
    }

    #[test]
    fn publish_snapshot_round_trip_works() {
        let shared = TransportShared::default();
        let mut t = transport();
        t.start();
        t.cycle_end(128, PERIOD, 42);
        t.publish(&shared);
        let (state, position) = Position::snapshot(&shared);
        assert_eq!(state, TransportState::Rolling);
        assert_eq!(position.frame_rate, 48_000);
        assert_eq!(position.usecs, 42);
    }
}
