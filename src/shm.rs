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

//! The shared data plane. One control segment holds the engine header and
//! the port registry; one segment per port type holds that type's buffer
//! arena. Clients attach to the same segments and see the same logical
//! objects as plain structs.

use crate::{
    error::{ShmError, ShmResult},
    formats::{
        CLIENT_NAME_SIZE, FrameTime, Frames, PORT_NAME_SIZE, PORT_TYPE_NAME_SIZE, PORT_TYPES_MAX,
        SampleRate, Usecs,
    },
};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    mem::size_of,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
};
use tracing::warn;

const CONTROL_MAGIC: u32 = 0x4a41_434b; // "JACK"
const CONTROL_VERSION: u32 = 1;

/// Untyped view of a buffer that lives in a segment owned by somebody
/// else. It is only safe to read from or write to the buffer while the
/// cycle ordering guarantees (or a lock) make the access exclusive.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    ptr: usize,
    len: usize,
}

impl RawBuffer {
    pub fn new(ptr: usize, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn from_slice<T>(slice: &[T]) -> Self {
        Self::new(slice.as_ptr() as usize, size_of::<T>() * slice.len())
    }

    pub fn buffer(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// # Safety
    /// The caller must guarantee exclusive access for the duration of the
    /// borrow, normally by being the scheduled writer of the current
    /// cycle.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_mut(&self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    pub fn as_f32(&self) -> &[f32] {
        unsafe { from_raw_parts(self.ptr as *const f32, self.len / size_of::<f32>()) }
    }

    /// # Safety
    /// See [`RawBuffer::buffer_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_f32_mut(&self) -> &mut [f32] {
        unsafe { from_raw_parts_mut(self.ptr as *mut f32, self.len / size_of::<f32>()) }
    }

    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Seqlock-published frame timer, written only by the cycle thread.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FrameTimerShared {
    guard1: AtomicU32,
    pub frames: AtomicU64,
    pub current_wakeup: AtomicU64,
    pub next_wakeup: AtomicU64,
    pub initialized: AtomicU32,
    guard2: AtomicU32,
}

impl FrameTimerShared {
    pub fn publish(&self, frames: FrameTime, current_wakeup: Usecs, next_wakeup: Usecs) {
        self.guard1.fetch_add(1, Ordering::Release);
        self.frames.store(frames, Ordering::Relaxed);
        self.current_wakeup.store(current_wakeup, Ordering::Relaxed);
        self.next_wakeup.store(next_wakeup, Ordering::Relaxed);
        self.initialized.store(1, Ordering::Relaxed);
        self.guard2.fetch_add(1, Ordering::Release);
    }

    /// Retries until a consistent snapshot is read.
    pub fn snapshot(&self) -> (FrameTime, Usecs, Usecs) {
        loop {
            let g2 = self.guard2.load(Ordering::Acquire);
            let frames = self.frames.load(Ordering::Relaxed);
            let current = self.current_wakeup.load(Ordering::Relaxed);
            let next = self.next_wakeup.load(Ordering::Relaxed);
            let g1 = self.guard1.load(Ordering::Acquire);
            if g1 == g2 {
                return (frames, current, next);
            }
            std::hint::spin_loop();
        }
    }
}

/// Transport position as published in the control segment. All fields are
/// atomics so torn reads are impossible even across processes; the guard
/// pair makes multi-field snapshots consistent.
#[repr(C)]
#[derive(Debug, Default)]
pub struct TransportShared {
    guard1: AtomicU32,
    pub state: AtomicU32,
    pub frame: AtomicU64,
    pub frame_rate: AtomicU32,
    pub usecs: AtomicU64,
    pub valid: AtomicU32,
    pub bar: AtomicI32,
    pub beat: AtomicI32,
    pub tick: AtomicI32,
    pub bar_start_tick: AtomicU64,
    pub beats_per_bar: AtomicU32,
    pub beat_type: AtomicU32,
    pub ticks_per_beat: AtomicU64,
    pub beats_per_minute: AtomicU64,
    pub unique: AtomicU64,
    guard2: AtomicU32,
}

impl TransportShared {
    pub fn begin_write(&self) {
        self.guard1.fetch_add(1, Ordering::Release);
    }

    pub fn end_write(&self) {
        self.guard2.fetch_add(1, Ordering::Release);
    }

    pub fn read_consistent<T>(&self, mut read: impl FnMut(&Self) -> T) -> T {
        loop {
            let g2 = self.guard2.load(Ordering::Acquire);
            let value = read(self);
            let g1 = self.guard1.load(Ordering::Acquire);
            if g1 == g2 {
                return value;
            }
            std::hint::spin_loop();
        }
    }
}

/// One entry of the port type table.
#[repr(C)]
#[derive(Debug)]
pub struct PortTypeShared {
    pub name: [u8; PORT_TYPE_NAME_SIZE],
    /// Bytes per frame; negative means the per-port buffer has a fixed
    /// size irrespective of the frame count.
    pub scale: i32,
    pub buffer_bytes: AtomicU32,
    pub zero_offset: AtomicU32,
    pub has_mixdown: u32,
    /// Bumped whenever the arena is reallocated, part of the segment id.
    pub segment_generation: AtomicU64,
}

/// Per-port record in the control segment.
#[repr(C)]
#[derive(Debug)]
pub struct PortShared {
    pub in_use: AtomicU32,
    pub id: u32,
    pub uuid: [u8; 16],
    pub client_id: u32,
    pub client_uuid: [u8; 16],
    pub ptype_id: u32,
    pub flags: AtomicU32,
    pub name: [u8; PORT_NAME_SIZE],
    pub alias1: [u8; PORT_NAME_SIZE],
    pub alias2: [u8; PORT_NAME_SIZE],
    /// Arena offset. Valid for outputs while `in_use`; 0 for inputs.
    pub offset: AtomicU32,
    pub capture_latency_min: AtomicU32,
    pub capture_latency_max: AtomicU32,
    pub playback_latency_min: AtomicU32,
    pub playback_latency_max: AtomicU32,
    pub total_latency: AtomicU32,
    pub monitor_requests: AtomicU32,
    pub has_mixdown: AtomicU32,
}

/// Per-cycle client run state, shared with the client's process thread.
pub mod client_state {
    pub const NOT_TRIGGERED: u32 = 0;
    pub const TRIGGERED: u32 = 1;
    pub const RUNNING: u32 = 2;
    pub const FINISHED: u32 = 3;
}

/// Control block of one client. Lives in its own shm segment for external
/// clients and on the heap for internal and driver clients.
#[repr(C)]
#[derive(Debug)]
pub struct ClientControlShared {
    pub id: u32,
    pub pid: u32,
    pub uuid: [u8; 16],
    pub client_type: u32,
    pub name: [u8; CLIENT_NAME_SIZE],
    pub active: AtomicU32,
    pub dead: AtomicU32,
    pub state: AtomicU32,
    pub nframes: AtomicU32,
    pub timed_out: AtomicU32,
    pub signalled_at: AtomicU64,
    pub awake_at: AtomicU64,
    pub finished_at: AtomicU64,
    pub last_status: AtomicI32,
    /// One bit per callback kind, see [`crate::protocol::callback_bits`].
    pub callbacks: AtomicU32,
    /// Set by the engine while the transport waits for this slow-sync
    /// client's vote.
    pub sync_poll: AtomicU32,
    /// The client's sync callback result, read back at cycle end.
    pub sync_ready: AtomicU32,
}

impl Default for ClientControlShared {
    fn default() -> Self {
        Self {
            id: 0,
            pid: 0,
            uuid: [0; 16],
            client_type: 0,
            name: [0; CLIENT_NAME_SIZE],
            active: AtomicU32::new(0),
            dead: AtomicU32::new(0),
            state: AtomicU32::new(0),
            nframes: AtomicU32::new(0),
            timed_out: AtomicU32::new(0),
            signalled_at: AtomicU64::new(0),
            awake_at: AtomicU64::new(0),
            finished_at: AtomicU64::new(0),
            last_status: AtomicI32::new(0),
            callbacks: AtomicU32::new(0),
            sync_poll: AtomicU32::new(0),
            sync_ready: AtomicU32::new(0),
        }
    }
}

impl ClientControlShared {
    pub fn has_callback(&self, bit: u32) -> bool {
        self.callbacks.load(Ordering::Relaxed) & bit != 0
    }

    pub fn set_callback(&self, bit: u32, set: bool) {
        if set {
            self.callbacks.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.callbacks.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) != 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed) != 0
    }
}

/// Fixed header of the control segment, followed by `ports[port_max]`.
#[repr(C)]
pub struct EngineControlHeader {
    pub magic: u32,
    pub version: u32,
    pub engine_pid: u32,
    pub port_max: u32,
    pub engine_ok: AtomicU32,
    pub buffer_size: AtomicU32,
    pub sample_rate: AtomicU32,
    pub client_priority: AtomicI32,
    pub max_client_priority: AtomicI32,
    pub cpu_load: AtomicU32,
    pub xruns: AtomicU32,
    pub xrun_delayed_usecs: AtomicU32,
    pub max_delayed_usecs: AtomicU32,
    pub freewheeling: AtomicU32,
    pub n_port_types: AtomicU32,
    pub port_types: [PortTypeShared; PORT_TYPES_MAX],
    pub frame_timer: FrameTimerShared,
    pub transport: TransportShared,
    /// BBT updates written by an out-of-process timebase master, merged
    /// by the engine at cycle end.
    pub transport_pending: TransportShared,
}

impl EngineControlHeader {
    pub fn cpu_load_value(&self) -> f32 {
        f32::from_bits(self.cpu_load.load(Ordering::Relaxed))
    }

    pub fn set_cpu_load(&self, load: f32) {
        self.cpu_load.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn buffer_size_value(&self) -> Frames {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub fn sample_rate_value(&self) -> SampleRate {
        self.sample_rate.load(Ordering::Relaxed)
    }
}

fn create_segment(os_id: &str, size: usize) -> ShmResult<Shmem> {
    match ShmemConf::new().size(size).os_id(os_id).create() {
        Ok(shmem) => Ok(shmem),
        Err(ShmemError::MappingIdExists) => {
            warn!("Removing stale shm segment '{os_id}'");
            if let Ok(mut stale) = ShmemConf::new().os_id(os_id).open() {
                stale.set_owner(true);
                drop(stale);
            }
            Ok(ShmemConf::new().size(size).os_id(os_id).create()?)
        }
        Err(e) => Err(e.into()),
    }
}

/// The engine's control segment. The creating side owns the mapping and
/// unlinks it on drop; attached clients do not.
pub struct ControlShm {
    shmem: Shmem,
    port_max: u32,
}

// All mutation goes through atomics; the raw pointer itself is stable for
// the lifetime of the mapping.
unsafe impl Send for ControlShm {}
unsafe impl Sync for ControlShm {}

impl ControlShm {
    pub fn size_for(port_max: u32) -> usize {
        size_of::<EngineControlHeader>() + port_max as usize * size_of::<PortShared>()
    }

    pub fn create(os_id: &str, port_max: u32) -> ShmResult<Self> {
        let size = Self::size_for(port_max);
        let shmem = create_segment(os_id, size)?;
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, size);
        }
        let control = Self { shmem, port_max };
        let header = control.header();
        unsafe {
            let header_mut = &mut *(control.shmem.as_ptr() as *mut EngineControlHeader);
            header_mut.magic = CONTROL_MAGIC;
            header_mut.version = CONTROL_VERSION;
            header_mut.engine_pid = std::process::id();
            header_mut.port_max = port_max;
        }
        header.engine_ok.store(0, Ordering::Relaxed);
        Ok(control)
    }

    pub fn open(os_id: &str) -> ShmResult<Self> {
        let shmem = ShmemConf::new().os_id(os_id).open()?;
        if shmem.len() < size_of::<EngineControlHeader>() {
            return Err(ShmError::SegmentTooSmall {
                have: shmem.len(),
                need: size_of::<EngineControlHeader>(),
            });
        }
        let header = unsafe { &*(shmem.as_ptr() as *const EngineControlHeader) };
        if header.magic != CONTROL_MAGIC || header.version != CONTROL_VERSION {
            return Err(ShmError::BadMagic(os_id.to_owned()));
        }
        let port_max = header.port_max;
        let need = Self::size_for(port_max);
        if shmem.len() < need {
            return Err(ShmError::SegmentTooSmall {
                have: shmem.len(),
                need,
            });
        }
        Ok(Self { shmem, port_max })
    }

    pub fn header(&self) -> &EngineControlHeader {
        unsafe { &*(self.shmem.as_ptr() as *const EngineControlHeader) }
    }

    pub fn port(&self, id: u32) -> &PortShared {
        debug_assert!(id < self.port_max);
        unsafe {
            let base = self.shmem.as_ptr().add(size_of::<EngineControlHeader>())
                as *const PortShared;
            &*base.add(id as usize)
        }
    }

    /// # Safety
    /// Only the engine writes port records, under the graph write lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn port_mut(&self, id: u32) -> &mut PortShared {
        debug_assert!(id < self.port_max);
        unsafe {
            let base =
                self.shmem.as_ptr().add(size_of::<EngineControlHeader>()) as *mut PortShared;
            &mut *base.add(id as usize)
        }
    }

    pub fn port_max(&self) -> u32 {
        self.port_max
    }
}

/// Buffer arena of one port type: `port_max + 1` slots, the last one being
/// the zero-filled sentinel consumed by unconnected input ports.
pub struct PortSegment {
    shmem: Shmem,
    buffer_bytes: usize,
}

unsafe impl Send for PortSegment {}
unsafe impl Sync for PortSegment {}

impl PortSegment {
    pub fn create(os_id: &str, port_max: u32, buffer_bytes: usize) -> ShmResult<Self> {
        let size = (port_max as usize + 1) * buffer_bytes;
        let shmem = create_segment(os_id, size)?;
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, size);
        }
        Ok(Self {
            shmem,
            buffer_bytes,
        })
    }

    pub fn open(os_id: &str, buffer_bytes: usize) -> ShmResult<Self> {
        let shmem = ShmemConf::new().os_id(os_id).open()?;
        Ok(Self {
            shmem,
            buffer_bytes,
        })
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn size(&self) -> usize {
        self.shmem.len()
    }

    pub fn zero_offset(&self) -> u32 {
        (self.size() - self.buffer_bytes) as u32
    }

    pub fn buffer_at(&self, offset: u32) -> RawBuffer {
        debug_assert!(offset as usize + self.buffer_bytes <= self.size());
        RawBuffer::new(
            self.shmem.as_ptr() as usize + offset as usize,
            self.buffer_bytes,
        )
    }

    /// Re-zeroes the sentinel slot. Called after arena (re)creation and
    /// after buffer size changes.
    pub fn clear_zero_buffer(&self) {
        let buf = self.buffer_at(self.zero_offset());
        unsafe {
            buf.buffer_mut().fill(0);
        }
    }
}

/// One client's control block segment.
pub struct ClientControlShm {
    shmem: Shmem,
}

unsafe impl Send for ClientControlShm {}
unsafe impl Sync for ClientControlShm {}

impl ClientControlShm {
    pub fn create(os_id: &str) -> ShmResult<Self> {
        let shmem = create_segment(os_id, size_of::<ClientControlShared>())?;
        unsafe {
            std::ptr::write_bytes(shmem.as_ptr(), 0, size_of::<ClientControlShared>());
        }
        Ok(Self { shmem })
    }

    pub fn open(os_id: &str) -> ShmResult<Self> {
        let shmem = ShmemConf::new().os_id(os_id).open()?;
        if shmem.len() < size_of::<ClientControlShared>() {
            return Err(ShmError::SegmentTooSmall {
                have: shmem.len(),
                need: size_of::<ClientControlShared>(),
            });
        }
        Ok(Self { shmem })
    }

    pub fn control(&self) -> &ClientControlShared {
        unsafe { &*(self.shmem.as_ptr() as *const ClientControlShared) }
    }

    /// # Safety
    /// Only the engine initializes the POD part of the block, before the
    /// segment id is handed to the client.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn control_mut(&self) -> &mut ClientControlShared {
        unsafe { &mut *(self.shmem.as_ptr() as *mut ClientControlShared) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_id(suffix: &str) -> String {
        format!("jackd-rs-test-{}-{suffix}", std::process::id())
    }

    #[test]
    fn control_shm_round_trip_works() {
        let id = test_id("control");
        let control = ControlShm::create(&id, 16).expect("create failed");
        control.header().buffer_size.store(128, Ordering::Relaxed);
        unsafe {
            let port = control.port_mut(3);
            port.id = 3;
            port.name = crate::formats::to_fixed_str("system:capture_1");
            port.in_use.store(1, Ordering::Relaxed);
        }

        let attached = ControlShm::open(&id).expect("open failed");
        assert_eq!(attached.header().buffer_size_value(), 128);
        assert_eq!(
            crate::formats::from_fixed_str(&attached.port(3).name),
            "system:capture_1"
        );
    }

    #[test]
    fn port_segment_zero_buffer_is_zeroed() {
        let id = test_id("ports");
        let segment = PortSegment::create(&id, 4, 512).expect("create failed");
        segment.clear_zero_buffer();
        let zero = segment.buffer_at(segment.zero_offset());
        assert!(zero.buffer().iter().all(|b| *b == 0));
        assert_eq!(segment.size(), 5 * 512);
    }

    #[test]
    fn frame_timer_snapshot_is_consistent() {
        let timer = FrameTimerShared::default();
        timer.publish(1024, 10_000, 12_667);
        assert_eq!(timer.snapshot(), (1024, 10_000, 12_667));
    }
}
