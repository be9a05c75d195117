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

//! The backend driver contract. A driver supplies the periodic "wake and
//! process N frames" heartbeat, moves audio between hardware and the
//! physical ports it registers, and otherwise stays out of the engine's
//! way. Hardware backends live outside this crate; the dummy driver below
//! clocks the engine off the system timer.

use crate::{
    error::{DriverResult},
    formats::{Frames, PortId, SampleRate, Usecs, period_usecs},
    protocol::{LatencyRange, PortFlags},
    shm::RawBuffer,
    time::get_microseconds,
};
use crossbeam::channel::{Receiver, Sender, bounded};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DriverWait {
    pub nframes: Frames,
    pub delayed_usecs: f32,
}

/// A physical port the driver wants registered on its behalf. The engine
/// canonicalises the name and stores `short_name` as alias1.
#[derive(Debug, Clone)]
pub struct DriverPortSpec {
    pub short_name: String,
    pub type_name: String,
    pub flags: PortFlags,
    pub latency: LatencyRange,
}

pub trait Driver: Send {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> SampleRate;

    fn buffer_size(&self) -> Frames;

    fn period_usecs(&self) -> f32 {
        period_usecs(self.buffer_size(), self.sample_rate())
    }

    /// Physical ports to register at attach time.
    fn port_specs(&self) -> Vec<DriverPortSpec>;

    /// Ids of the ports the engine registered, in `port_specs` order.
    fn set_ports(&mut self, capture: Vec<PortId>, playback: Vec<PortId>);

    fn start(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        Ok(())
    }

    /// Blocks until the next period boundary.
    fn wait(&mut self) -> DriverResult<DriverWait>;

    /// Microsecond timestamp of the last wakeup, the effective time base
    /// of the frame timer.
    fn last_wait_ust(&self) -> Usecs;

    /// Moves captured audio into the capture ports' output buffers.
    fn read(&mut self, capture: &[(PortId, RawBuffer)], nframes: Frames) -> DriverResult<()>;

    /// Moves the playback ports' resolved buffers out to hardware.
    fn write(&mut self, playback: &[(PortId, RawBuffer)], nframes: Frames) -> DriverResult<()>;

    /// Consumes one period without involving any client.
    fn null_cycle(&mut self, nframes: Frames) -> DriverResult<()> {
        let _ = nframes;
        Ok(())
    }

    fn buffer_size_changed(&mut self, nframes: Frames) -> DriverResult<()>;
}

fn audio_port_specs(capture_channels: u32, playback_channels: u32) -> Vec<DriverPortSpec> {
    let mut specs = Vec::new();
    for n in 1..=capture_channels {
        specs.push(DriverPortSpec {
            short_name: format!("capture_{n}"),
            type_name: crate::formats::AUDIO_TYPE_NAME.to_owned(),
            flags: PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
            latency: LatencyRange::default(),
        });
    }
    for n in 1..=playback_channels {
        specs.push(DriverPortSpec {
            short_name: format!("playback_{n}"),
            type_name: crate::formats::AUDIO_TYPE_NAME.to_owned(),
            flags: PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
            latency: LatencyRange::default(),
        });
    }
    specs
}

/// Clocks the engine off the monotonic timer without touching any
/// hardware. Capture ports produce silence, playback data is discarded.
pub struct DummyDriver {
    sample_rate: SampleRate,
    buffer_size: Frames,
    capture_channels: u32,
    playback_channels: u32,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    next_wakeup: Usecs,
    last_wait: Usecs,
}

impl DummyDriver {
    pub fn new(
        sample_rate: SampleRate,
        buffer_size: Frames,
        capture_channels: u32,
        playback_channels: u32,
    ) -> Self {
        Self {
            sample_rate,
            buffer_size,
            capture_channels,
            playback_channels,
            capture_ports: Vec::new(),
            playback_ports: Vec::new(),
            next_wakeup: 0,
            last_wait: 0,
        }
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &str {
        "dummy_pcm"
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn buffer_size(&self) -> Frames {
        self.buffer_size
    }

    fn port_specs(&self) -> Vec<DriverPortSpec> {
        audio_port_specs(self.capture_channels, self.playback_channels)
    }

    fn set_ports(&mut self, capture: Vec<PortId>, playback: Vec<PortId>) {
        self.capture_ports = capture;
        self.playback_ports = playback;
    }

    fn start(&mut self) -> DriverResult<()> {
        self.next_wakeup = get_microseconds() + self.period_usecs() as Usecs;
        debug!("dummy driver started");
        Ok(())
    }

    fn wait(&mut self) -> DriverResult<DriverWait> {
        let now = get_microseconds();
        if now < self.next_wakeup {
            std::thread::sleep(std::time::Duration::from_micros(self.next_wakeup - now));
        }
        let woke = get_microseconds();
        let delayed_usecs = woke.saturating_sub(self.next_wakeup) as f32;
        self.last_wait = woke;
        self.next_wakeup += self.period_usecs() as Usecs;
        if self.next_wakeup < woke {
            // fell badly behind, resynchronize
            self.next_wakeup = woke + self.period_usecs() as Usecs;
        }
        Ok(DriverWait {
            nframes: self.buffer_size,
            delayed_usecs,
        })
    }

    fn last_wait_ust(&self) -> Usecs {
        self.last_wait
    }

    fn read(&mut self, capture: &[(PortId, RawBuffer)], nframes: Frames) -> DriverResult<()> {
        for (_, buffer) in capture {
            let samples = unsafe { buffer.as_f32_mut() };
            for sample in samples.iter_mut().take(nframes as usize) {
                *sample = 0.0;
            }
        }
        Ok(())
    }

    fn write(&mut self, _playback: &[(PortId, RawBuffer)], _nframes: Frames) -> DriverResult<()> {
        Ok(())
    }

    fn buffer_size_changed(&mut self, nframes: Frames) -> DriverResult<()> {
        self.buffer_size = nframes;
        Ok(())
    }
}

/// Driven explicitly with [`ManualDriver::tick`]; `wait` blocks until the
/// next tick arrives. Capture ports are filled with a constant, playback
/// data is captured for inspection. Exists for scenario tests and offline
/// rendering experiments.
pub struct ManualDriver {
    sample_rate: SampleRate,
    buffer_size: Frames,
    capture_channels: u32,
    playback_channels: u32,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    tick_rx: Receiver<()>,
    last_wait: Usecs,
    pub capture_fill: f32,
    written: Arc<Mutex<Vec<Vec<f32>>>>,
}

pub struct ManualDriverHandle {
    tick_tx: Sender<()>,
    written: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl ManualDriverHandle {
    /// Queues one wakeup; returns false if the driver is gone or a tick
    /// is already pending.
    pub fn tick(&self) -> bool {
        self.tick_tx.try_send(()).is_ok()
    }

    /// Playback data of the most recent cycle, one vec per channel.
    pub fn written(&self) -> Vec<Vec<f32>> {
        self.written.lock().expect("written buffer lock poisoned").clone()
    }
}

impl ManualDriver {
    pub fn new(
        sample_rate: SampleRate,
        buffer_size: Frames,
        capture_channels: u32,
        playback_channels: u32,
    ) -> (Self, ManualDriverHandle) {
        let (tick_tx, tick_rx) = bounded(1);
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sample_rate,
                buffer_size,
                capture_channels,
                playback_channels,
                capture_ports: Vec::new(),
                playback_ports: Vec::new(),
                tick_rx,
                last_wait: 0,
                capture_fill: 0.5,
                written: Arc::clone(&written),
            },
            ManualDriverHandle { tick_tx, written },
        )
    }
}

impl Driver for ManualDriver {
    fn name(&self) -> &str {
        "manual_pcm"
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn buffer_size(&self) -> Frames {
        self.buffer_size
    }

    fn port_specs(&self) -> Vec<DriverPortSpec> {
        audio_port_specs(self.capture_channels, self.playback_channels)
    }

    fn set_ports(&mut self, capture: Vec<PortId>, playback: Vec<PortId>) {
        self.capture_ports = capture;
        self.playback_ports = playback;
    }

    fn wait(&mut self) -> DriverResult<DriverWait> {
        if self.tick_rx.recv().is_err() {
            return Err(crate::error::DriverError::WaitFailed(
                "tick source closed".to_owned(),
            ));
        }
        self.last_wait = get_microseconds();
        Ok(DriverWait {
            nframes: self.buffer_size,
            delayed_usecs: 0.0,
        })
    }

    fn last_wait_ust(&self) -> Usecs {
        self.last_wait
    }

    fn read(&mut self, capture: &[(PortId, RawBuffer)], nframes: Frames) -> DriverResult<()> {
        for (_, buffer) in capture {
            let samples = unsafe { buffer.as_f32_mut() };
            for sample in samples.iter_mut().take(nframes as usize) {
                *sample = self.capture_fill;
            }
        }
        Ok(())
    }

    fn write(&mut self, playback: &[(PortId, RawBuffer)], nframes: Frames) -> DriverResult<()> {
        let mut written = self.written.lock().expect("written buffer lock poisoned");
        written.clear();
        for (_, buffer) in playback {
            written.push(buffer.as_f32()[..nframes as usize].to_vec());
        }
        Ok(())
    }

    fn buffer_size_changed(&mut self, nframes: Frames) -> DriverResult<()> {
        self.buffer_size = nframes;
        Ok(())
    }
}
