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

use crate::{
    error::{SystemClockError, SystemClockResult},
    formats::{FrameTime, Frames, Usecs},
};
use libc::{CLOCK_MONOTONIC, clock_gettime, clockid_t, timespec};

pub fn system_time_monotonic() -> SystemClockResult<timespec> {
    system_time_for_clock_id(CLOCK_MONOTONIC)
}

fn system_time_for_clock_id(clock_id: clockid_t) -> SystemClockResult<timespec> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(clock_id, &mut tp) } == -1 {
        Err(SystemClockError("could not get system time".to_owned()))
    } else {
        Ok(tp)
    }
}

/// Current time on the monotonic clock in microseconds. All engine
/// timestamps (wakeups, client signalled/awake/finished marks, event ack
/// deadlines) use this time base.
pub fn get_microseconds() -> Usecs {
    match system_time_monotonic() {
        Ok(tp) => tp.tv_sec as u64 * 1_000_000 + tp.tv_nsec as u64 / 1_000,
        Err(_) => 0,
    }
}

/// Estimates the driver's next wakeup with a second order delay-locked
/// loop, so that clients can map frame counts to wall-clock time between
/// interrupts.
///
/// `frames` only advances on completed cycles. A cycle that follows an
/// xrun (reset pending) re-seeds the prediction from the observed wakeup
/// and does not advance the frame counter, since one or more deadlines
/// were missed in the backend anyway.
#[derive(Debug, Clone)]
pub struct FrameTimer {
    pub frames: FrameTime,
    pub current_wakeup: Usecs,
    pub next_wakeup: Usecs,
    pub filter_coefficient: f32,
    pub second_order_integrator: f32,
    pub reset_pending: bool,
    pub initialized: bool,
    first_wakeup: bool,
}

impl FrameTimer {
    pub fn new(frame_time_offset: FrameTime) -> Self {
        Self {
            frames: frame_time_offset,
            current_wakeup: 0,
            next_wakeup: 0,
            filter_coefficient: 0.01,
            second_order_integrator: 0.0,
            reset_pending: false,
            initialized: false,
            first_wakeup: true,
        }
    }

    /// Called once per driver wakeup, before the cycle runs. `now` is the
    /// driver's `last_wait_ust`. Returns false if the frame counter was
    /// not advanced.
    pub fn cycle_begin(&mut self, now: Usecs, period_usecs: f32, nframes: Frames) -> bool {
        if self.first_wakeup {
            self.next_wakeup = now + period_usecs as Usecs;
            self.first_wakeup = false;
            if self.reset_pending {
                // an xrun on the very first cycle: there is no prediction
                // to reset yet, and one or more deadlines were missed in
                // the backend anyway
                self.reset_pending = false;
                self.initialized = true;
                return false;
            }
            // the freshly seeded prediction makes delta = -period here,
            // which is what primes the integrator
            self.increment(now, period_usecs, nframes);
            return true;
        }

        if self.reset_pending {
            self.current_wakeup = now;
            self.next_wakeup = now + period_usecs as Usecs;
            self.reset_pending = false;
            return false;
        }

        self.increment(now, period_usecs, nframes);
        true
    }

    fn increment(&mut self, now: Usecs, period_usecs: f32, nframes: Frames) {
        let delta = now as i64 - self.next_wakeup as i64;

        self.current_wakeup = self.next_wakeup;
        self.frames += nframes as FrameTime;
        self.second_order_integrator += 0.5 * self.filter_coefficient * delta as f32;
        let correction = (self.filter_coefficient
            * (delta as f32 + self.second_order_integrator))
            .floor() as i64;
        self.next_wakeup =
            (self.current_wakeup as i64 + period_usecs as i64 + correction).max(0) as Usecs;
        self.initialized = true;
    }

    pub fn reset(&mut self) {
        self.reset_pending = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PERIOD: f32 = 2_667.0; // 128 frames at 48 kHz

    #[test]
    fn first_wakeup_seeds_prediction_and_counts() {
        let mut timer = FrameTimer::new(0);
        assert!(timer.cycle_begin(1_000_000, PERIOD, 128));
        // the first wakeup counts like any other
        assert_eq!(timer.frames, 128);
        assert_eq!(timer.current_wakeup, 1_000_000 + PERIOD as u64);
        assert!(timer.next_wakeup > timer.current_wakeup);
    }

    #[test]
    fn xrun_on_first_wakeup_skips_increment() {
        let mut timer = FrameTimer::new(0);
        timer.reset();
        assert!(!timer.cycle_begin(1_000_000, PERIOD, 128));
        assert_eq!(timer.frames, 0);
        assert!(!timer.reset_pending);
        assert_eq!(timer.next_wakeup, 1_000_000 + PERIOD as u64);
    }

    #[test]
    fn frames_advance_by_nframes_per_cycle() {
        let mut timer = FrameTimer::new(0);
        let mut now = 1_000_000;
        timer.cycle_begin(now, PERIOD, 128);
        for _ in 0..10 {
            now += PERIOD as u64;
            assert!(timer.cycle_begin(now, PERIOD, 128));
        }
        assert_eq!(timer.frames, 11 * 128);
    }

    #[test]
    fn next_wakeup_is_monotonic() {
        let mut timer = FrameTimer::new(0);
        let mut now = 1_000_000;
        timer.cycle_begin(now, PERIOD, 128);
        let mut last_current = 0;
        for i in 0..100 {
            // jittered wakeups
            now += PERIOD as u64 + if i % 2 == 0 { 40 } else { 0 };
            timer.cycle_begin(now, PERIOD, 128);
            assert!(timer.next_wakeup >= timer.current_wakeup);
            assert!(timer.current_wakeup >= last_current);
            last_current = timer.current_wakeup;
        }
    }

    #[test]
    fn reset_skips_frame_increment() {
        let mut timer = FrameTimer::new(0);
        let mut now = 1_000_000;
        timer.cycle_begin(now, PERIOD, 128);
        now += PERIOD as u64;
        timer.cycle_begin(now, PERIOD, 128);
        let frames_before = timer.frames;

        timer.reset();
        now += 5 * PERIOD as u64; // late after an xrun
        assert!(!timer.cycle_begin(now, PERIOD, 128));
        assert_eq!(timer.frames, frames_before);
        assert_eq!(timer.current_wakeup, now);
        assert_eq!(timer.next_wakeup, now + PERIOD as u64);
    }

    #[test]
    fn dll_converges_on_steady_clock() {
        let mut timer = FrameTimer::new(0);
        let mut now = 1_000_000u64;
        // the contrived first-wakeup delta shocks the loop by a full
        // period; give it time to ring down
        timer.cycle_begin(now, PERIOD, 128);
        for _ in 0..3_000 {
            now += PERIOD as u64;
            timer.cycle_begin(now, PERIOD, 128);
        }
        let err = timer.next_wakeup as i64 - (now + PERIOD as u64) as i64;
        assert!(err.abs() < 50, "prediction error {err} usecs");
    }
}
