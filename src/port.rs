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

//! Port registry and port type capabilities. Buffer init and mixdown are
//! selected per type through a capability object; audio and MIDI are
//! built in, further types register through the same table.

use crate::{
    error::{EngineError, EngineResult},
    formats::{
        AUDIO_TYPE_NAME, ClientId, ConnectionId, FIXED_BUFFER_SIZE, Frames, MIDI_TYPE_NAME,
        PORT_NAME_SIZE, PortId, PortTypeId, Uuid, from_fixed_str, to_fixed_str,
    },
    protocol::PortFlags,
    shm::{ControlShm, RawBuffer},
};
use std::{collections::HashMap, sync::atomic::Ordering};
use tracing::{debug, warn};

pub type BufferInitFn = fn(&mut [u8], Frames);
pub type MixdownFn = fn(&mut [u8], &[RawBuffer], Frames);

/// Per-type capability object. All ports of one type share a buffer arena
/// and these functions.
pub struct PortTypeInfo {
    pub name: &'static str,
    /// Bytes per frame; negative means a fixed-size buffer irrespective
    /// of the frame count.
    pub scale: i32,
    pub buffer_init: BufferInitFn,
    pub mixdown: Option<MixdownFn>,
}

impl PortTypeInfo {
    pub fn buffer_bytes(&self, nframes: Frames) -> usize {
        if self.scale < 0 {
            FIXED_BUFFER_SIZE
        } else {
            self.scale as usize * nframes as usize
        }
    }

    pub fn has_mixdown(&self) -> bool {
        self.mixdown.is_some()
    }
}

fn audio_buffer_init(buffer: &mut [u8], _nframes: Frames) {
    buffer.fill(0);
}

fn audio_mixdown(dst: &mut [u8], sources: &[RawBuffer], nframes: Frames) {
    let dst: &mut [f32] = unsafe {
        std::slice::from_raw_parts_mut(dst.as_mut_ptr().cast::<f32>(), dst.len() / size_of::<f32>())
    };
    let nframes = nframes as usize;
    let len = nframes.min(dst.len());
    for sample in dst[..len].iter_mut() {
        *sample = 0.0;
    }
    for source in sources {
        let src = source.as_f32();
        for (d, s) in dst.iter_mut().zip(src.iter()).take(nframes) {
            *d += *s;
        }
    }
}

pub fn builtin_port_types() -> Vec<PortTypeInfo> {
    vec![
        PortTypeInfo {
            name: AUDIO_TYPE_NAME,
            scale: size_of::<f32>() as i32,
            buffer_init: audio_buffer_init,
            mixdown: Some(audio_mixdown),
        },
        PortTypeInfo {
            name: MIDI_TYPE_NAME,
            scale: -1,
            buffer_init: midi::buffer_init,
            mixdown: Some(midi::mixdown),
        },
    ]
}

/// Raw MIDI buffer codec. The buffer holds a small header followed by
/// densely packed events, each a (time, size, data) record ordered by
/// time within one period.
pub mod midi {
    use super::{Frames, RawBuffer};

    const HEADER_BYTES: usize = 8;
    const EVENT_HEADER_BYTES: usize = 8;

    pub fn buffer_init(buffer: &mut [u8], _nframes: Frames) {
        buffer[..HEADER_BYTES].fill(0);
    }

    pub fn event_count(buffer: &[u8]) -> u32 {
        u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]])
    }

    fn data_used(buffer: &[u8]) -> usize {
        u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize
    }

    fn set_header(buffer: &mut [u8], count: u32, used: usize) {
        buffer[..4].copy_from_slice(&count.to_le_bytes());
        buffer[4..8].copy_from_slice(&(used as u32).to_le_bytes());
    }

    /// Appends one event; events must be written in time order. Returns
    /// false when the buffer is full.
    pub fn write_event(buffer: &mut [u8], time: Frames, data: &[u8]) -> bool {
        let count = event_count(buffer);
        let used = data_used(buffer);
        let offset = HEADER_BYTES + used;
        let needed = EVENT_HEADER_BYTES + data.len();
        if offset + needed > buffer.len() {
            return false;
        }
        buffer[offset..offset + 4].copy_from_slice(&time.to_le_bytes());
        buffer[offset + 4..offset + 8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        buffer[offset + 8..offset + 8 + data.len()].copy_from_slice(data);
        set_header(buffer, count + 1, used + needed);
        true
    }

    pub struct EventIter<'a> {
        buffer: &'a [u8],
        remaining: u32,
        offset: usize,
    }

    pub fn events(buffer: &[u8]) -> EventIter<'_> {
        EventIter {
            remaining: event_count(buffer),
            buffer,
            offset: HEADER_BYTES,
        }
    }

    impl<'a> Iterator for EventIter<'a> {
        type Item = (Frames, &'a [u8]);

        fn next(&mut self) -> Option<Self::Item> {
            if self.remaining == 0 {
                return None;
            }
            let b = self.buffer;
            let o = self.offset;
            if o + EVENT_HEADER_BYTES > b.len() {
                return None;
            }
            let time = u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
            let size =
                u32::from_le_bytes([b[o + 4], b[o + 5], b[o + 6], b[o + 7]]) as usize;
            if o + EVENT_HEADER_BYTES + size > b.len() {
                return None;
            }
            let data = &b[o + EVENT_HEADER_BYTES..o + EVENT_HEADER_BYTES + size];
            self.offset = o + EVENT_HEADER_BYTES + size;
            self.remaining -= 1;
            Some((time, data))
        }
    }

    /// Time-ordered merge of all source streams.
    pub fn mixdown(dst: &mut [u8], sources: &[RawBuffer], nframes: Frames) {
        buffer_init(dst, nframes);
        let mut iters: Vec<std::iter::Peekable<EventIter>> = sources
            .iter()
            .map(|s| events(s.buffer()).peekable())
            .collect();
        loop {
            let mut best: Option<(usize, Frames)> = None;
            for (i, it) in iters.iter_mut().enumerate() {
                if let Some((time, _)) = it.peek()
                    && best.is_none_or(|(_, t)| *time < t)
                {
                    best = Some((i, *time));
                }
            }
            let Some((i, _)) = best else {
                break;
            };
            let (time, data) = iters[i].next().expect("peeked event vanished");
            if !write_event(dst, time, data) {
                break;
            }
        }
    }
}

/// Engine-private mirror of one shared port record, carrying the
/// connection index sets the scheduler walks.
#[derive(Debug)]
pub struct PortInternal {
    pub id: PortId,
    pub uuid: Uuid,
    pub client_id: ClientId,
    pub name: String,
    pub alias1: Option<String>,
    pub alias2: Option<String>,
    pub ptype: PortTypeId,
    pub flags: PortFlags,
    /// Connections where this port is the destination.
    pub incoming: Vec<ConnectionId>,
    /// Connections where this port is the source.
    pub outgoing: Vec<ConnectionId>,
    /// Arena slot for output ports.
    pub arena_slot: Option<u32>,
}

impl PortInternal {
    pub fn is_input(&self) -> bool {
        self.flags.contains(PortFlags::IS_INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(PortFlags::IS_OUTPUT)
    }

    pub fn short_name(&self) -> &str {
        self.name.split_once(':').map(|(_, s)| s).unwrap_or(&self.name)
    }
}

/// The port registry: name table, per-type arena freelists and the shared
/// record mirror. All mutation happens under the graph write lock.
pub struct PortRegistry {
    port_max: u32,
    ports: Vec<Option<PortInternal>>,
    by_name: HashMap<String, PortId>,
    free_ids: Vec<PortId>,
    /// Per-type freelist of arena slots for output buffers.
    free_slots: Vec<Vec<u32>>,
    /// Counters behind `system:capture_N` style canonical names, indexed
    /// by (is_midi, is_input).
    physical_counters: [[u32; 2]; 2],
}

impl PortRegistry {
    pub fn new(port_max: u32, n_types: usize) -> Self {
        Self {
            port_max,
            ports: (0..port_max).map(|_| None).collect(),
            by_name: HashMap::new(),
            free_ids: (0..port_max).rev().collect(),
            free_slots: (0..n_types)
                .map(|_| (0..port_max).rev().collect())
                .collect(),
            physical_counters: [[0; 2]; 2],
        }
    }

    pub fn port_max(&self) -> u32 {
        self.port_max
    }

    pub fn get(&self, id: PortId) -> EngineResult<&PortInternal> {
        self.ports
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(EngineError::UnknownPortId(id))
    }

    pub fn get_mut(&mut self, id: PortId) -> EngineResult<&mut PortInternal> {
        self.ports
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnknownPortId(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortInternal> {
        self.ports.iter().flatten()
    }

    /// Looks a port up by its primary name or one of its aliases. The
    /// legacy equivalence rule maps `ALSA:` names onto `alsa_pcm:` so old
    /// session files keep connecting after a backend rename.
    pub fn find_by_name(&self, name: &str) -> EngineResult<PortId> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        for port in self.iter() {
            if port.alias1.as_deref() == Some(name) || port.alias2.as_deref() == Some(name) {
                return Ok(port.id);
            }
        }
        if let Some(rest) = name.strip_prefix("ALSA:") {
            let legacy = format!("alsa_pcm:{rest}");
            if let Some(id) = self.by_name.get(&legacy) {
                return Ok(*id);
            }
        }
        Err(EngineError::UnknownPort(name.to_owned()))
    }

    fn next_physical_name(&mut self, is_midi: bool, is_input: bool) -> String {
        let counter = &mut self.physical_counters[is_midi as usize][is_input as usize];
        *counter += 1;
        // an input port of the driver consumes playback data
        match (is_midi, is_input) {
            (false, false) => format!("system:capture_{counter}"),
            (false, true) => format!("system:playback_{counter}"),
            (true, false) => format!("system:midi_capture_{counter}"),
            (true, true) => format!("system:midi_playback_{counter}"),
        }
    }

    /// Registers a port and publishes its shared record. Driver-owned
    /// physical ports get canonical `system:` names, with the
    /// backend-supplied name preserved as alias1.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        control: &ControlShm,
        client_id: ClientId,
        client_uuid: Uuid,
        client_name: &str,
        short_name: &str,
        ptype: PortTypeId,
        type_info: &PortTypeInfo,
        flags: PortFlags,
        canonicalize: bool,
    ) -> EngineResult<PortId> {
        let requested = format!("{client_name}:{short_name}");
        if requested.len() >= PORT_NAME_SIZE {
            return Err(EngineError::PortNameTooLong(requested));
        }
        if self.by_name.contains_key(&requested) {
            return Err(EngineError::PortNameTaken(requested));
        }
        let is_input = flags.contains(PortFlags::IS_INPUT);
        let is_output = flags.contains(PortFlags::IS_OUTPUT);
        if is_input == is_output {
            return Err(EngineError::InvalidPortFlags(requested));
        }

        let Some(id) = self.free_ids.pop() else {
            return Err(EngineError::PortRegistryFull(self.port_max));
        };

        let (name, alias1) = if canonicalize && flags.contains(PortFlags::IS_PHYSICAL) {
            let canonical = self.next_physical_name(type_info.scale < 0, is_input);
            debug!("physical port '{requested}' registered as '{canonical}'");
            (canonical, Some(requested))
        } else {
            (requested, None)
        };

        let arena_slot = if is_output {
            let slot = self.free_slots[ptype as usize].pop();
            if slot.is_none() {
                self.free_ids.push(id);
                return Err(EngineError::PortRegistryFull(self.port_max));
            }
            slot
        } else {
            None
        };

        let uuid = Uuid::generate();
        let port = PortInternal {
            id,
            uuid,
            client_id,
            name: name.clone(),
            alias1: alias1.clone(),
            alias2: None,
            ptype,
            flags,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            arena_slot,
        };

        let buffer_bytes = control.header().port_types[ptype as usize]
            .buffer_bytes
            .load(Ordering::Relaxed);
        let shared = unsafe { control.port_mut(id) };
        shared.id = id;
        shared.uuid = uuid.to_bytes();
        shared.client_id = client_id;
        shared.client_uuid = client_uuid.to_bytes();
        shared.ptype_id = ptype;
        shared.flags.store(flags.bits(), Ordering::Relaxed);
        shared.name = to_fixed_str(&name);
        shared.alias1 = to_fixed_str(alias1.as_deref().unwrap_or(""));
        shared.alias2 = to_fixed_str("");
        shared
            .offset
            .store(arena_slot.unwrap_or(0) * buffer_bytes, Ordering::Relaxed);
        shared.capture_latency_min.store(0, Ordering::Relaxed);
        shared.capture_latency_max.store(0, Ordering::Relaxed);
        shared.playback_latency_min.store(0, Ordering::Relaxed);
        shared.playback_latency_max.store(0, Ordering::Relaxed);
        shared.total_latency.store(0, Ordering::Relaxed);
        shared.monitor_requests.store(0, Ordering::Relaxed);
        shared
            .has_mixdown
            .store(type_info.has_mixdown() as u32, Ordering::Relaxed);
        shared.in_use.store(1, Ordering::Release);

        self.by_name.insert(name, id);
        self.ports[id as usize] = Some(port);
        Ok(id)
    }

    /// Caller must have disconnected the port first.
    pub fn unregister(&mut self, control: &ControlShm, id: PortId) -> EngineResult<PortInternal> {
        let port = self.ports[id as usize]
            .take()
            .ok_or(EngineError::UnknownPortId(id))?;
        if !port.incoming.is_empty() || !port.outgoing.is_empty() {
            warn!("unregistering port '{}' with live connections", port.name);
        }
        self.by_name.remove(&port.name);
        if let Some(slot) = port.arena_slot {
            self.free_slots[port.ptype as usize].push(slot);
        }
        self.free_ids.push(id);

        let shared = unsafe { control.port_mut(id) };
        shared.in_use.store(0, Ordering::Release);
        shared.offset.store(0, Ordering::Relaxed);
        Ok(port)
    }

    pub fn rename(
        &mut self,
        control: &ControlShm,
        id: PortId,
        client_name: &str,
        short_name: &str,
    ) -> EngineResult<(String, String)> {
        let new_name = format!("{client_name}:{short_name}");
        if new_name.len() >= PORT_NAME_SIZE {
            return Err(EngineError::PortNameTooLong(new_name));
        }
        if self.by_name.contains_key(&new_name) {
            return Err(EngineError::PortNameTaken(new_name));
        }
        let port = self.get_mut(id)?;
        let old_name = std::mem::replace(&mut port.name, new_name.clone());
        self.by_name.remove(&old_name);
        self.by_name.insert(new_name.clone(), id);
        unsafe {
            control.port_mut(id).name = to_fixed_str(&new_name);
        }
        Ok((old_name, new_name))
    }

    pub fn set_alias(&mut self, control: &ControlShm, id: PortId, alias: &str) -> EngineResult<()> {
        if alias.len() >= PORT_NAME_SIZE {
            return Err(EngineError::PortNameTooLong(alias.to_owned()));
        }
        let port = self.get_mut(id)?;
        if port.alias1.is_none() {
            port.alias1 = Some(alias.to_owned());
            unsafe {
                control.port_mut(id).alias1 = to_fixed_str(alias);
            }
        } else {
            port.alias2 = Some(alias.to_owned());
            unsafe {
                control.port_mut(id).alias2 = to_fixed_str(alias);
            }
        }
        Ok(())
    }

    /// Recomputes shared buffer offsets after a buffer size change.
    pub fn republish_offsets(&self, control: &ControlShm) {
        for port in self.iter() {
            if let Some(slot) = port.arena_slot {
                let buffer_bytes = control.header().port_types[port.ptype as usize]
                    .buffer_bytes
                    .load(Ordering::Relaxed);
                unsafe {
                    control
                        .port_mut(port.id)
                        .offset
                        .store(slot * buffer_bytes, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn ports_of_client(&self, client_id: ClientId) -> Vec<PortId> {
        self.iter()
            .filter(|p| p.client_id == client_id)
            .map(|p| p.id)
            .collect()
    }

    pub fn free_slot_count(&self, ptype: PortTypeId) -> usize {
        self.free_slots[ptype as usize].len()
    }
}

/// Reads the full port name out of a shared record.
pub fn shared_port_name(control: &ControlShm, id: PortId) -> String {
    from_fixed_str(&control.port(id).name)
}

/// Mix buffers owned by the consuming side of multi-connection inputs.
/// The engine keeps one set for internal clients; every external client
/// library keeps its own.
#[derive(Default)]
pub struct MixBuffers {
    buffers: HashMap<PortId, Vec<u8>>,
}

impl MixBuffers {
    /// Resolves the buffer an input port reads this cycle: the zero
    /// sentinel with no connections, the single source's buffer with one
    /// (zero copy), or the port's mix buffer filled by the type's
    /// mixdown.
    pub fn resolve_input(
        &mut self,
        port_id: PortId,
        sources: &[RawBuffer],
        type_info: &PortTypeInfo,
        zero_buffer: RawBuffer,
        nframes: Frames,
    ) -> RawBuffer {
        match sources.len() {
            0 => zero_buffer,
            1 => sources[0],
            _ => {
                let Some(mixdown) = type_info.mixdown else {
                    return zero_buffer;
                };
                let bytes = type_info.buffer_bytes(nframes);
                let buffer = self.buffers.entry(port_id).or_default();
                if buffer.len() != bytes {
                    buffer.resize(bytes, 0);
                }
                mixdown(buffer, sources, nframes);
                RawBuffer::from_slice(buffer)
            }
        }
    }

    pub fn invalidate(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn control() -> ControlShm {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = format!("jackd-rs-port-test-{}-{n}", std::process::id());
        let control = ControlShm::create(&id, 16).expect("create failed");
        let types = builtin_port_types();
        for (i, t) in types.iter().enumerate() {
            let entry = &control.header().port_types[i];
            entry
                .buffer_bytes
                .store(t.buffer_bytes(128) as u32, Ordering::Relaxed);
        }
        control
            .header()
            .n_port_types
            .store(types.len() as u32, Ordering::Relaxed);
        control
    }

    fn registry() -> PortRegistry {
        PortRegistry::new(16, 2)
    }

    #[test]
    fn register_unregister_restores_freelist() {
        let control = control();
        let mut reg = registry();
        let types = builtin_port_types();
        let free_before = reg.free_slot_count(0);

        let id = reg
            .register(
                &control,
                1,
                Uuid(1),
                "pass",
                "out",
                0,
                &types[0],
                PortFlags::IS_OUTPUT,
                false,
            )
            .expect("register failed");
        assert_eq!(control.port(id).in_use.load(Ordering::Relaxed), 1);
        assert_eq!(reg.free_slot_count(0), free_before - 1);

        reg.unregister(&control, id).expect("unregister failed");
        assert_eq!(control.port(id).in_use.load(Ordering::Relaxed), 0);
        assert_eq!(reg.free_slot_count(0), free_before);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let control = control();
        let mut reg = registry();
        let types = builtin_port_types();
        reg.register(
            &control,
            1,
            Uuid(1),
            "pass",
            "out",
            0,
            &types[0],
            PortFlags::IS_OUTPUT,
            false,
        )
        .expect("register failed");
        assert!(matches!(
            reg.register(
                &control,
                1,
                Uuid(1),
                "pass",
                "out",
                0,
                &types[0],
                PortFlags::IS_OUTPUT,
                false,
            ),
            Err(EngineError::PortNameTaken(_))
        ));
    }

    #[test]
    fn physical_driver_ports_get_canonical_names() {
        let control = control();
        let mut reg = registry();
        let types = builtin_port_types();
        let id = reg
            .register(
                &control,
                0,
                Uuid(1),
                "alsa_pcm",
                "hw:0,0 capture",
                0,
                &types[0],
                PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
                true,
            )
            .expect("register failed");
        let port = reg.get(id).expect("port missing");
        assert_eq!(port.name, "system:capture_1");
        assert_eq!(port.alias1.as_deref(), Some("alsa_pcm:hw:0,0 capture"));
        // alias lookup still finds the original backend name
        assert_eq!(
            reg.find_by_name("alsa_pcm:hw:0,0 capture").expect("lookup"),
            id
        );
    }

    #[test]
    fn legacy_alsa_names_are_retried() {
        let control = control();
        let mut reg = registry();
        let types = builtin_port_types();
        let id = reg
            .register(
                &control,
                0,
                Uuid(1),
                "alsa_pcm",
                "capture_1",
                0,
                &types[0],
                PortFlags::IS_OUTPUT,
                false,
            )
            .expect("register failed");
        assert_eq!(reg.find_by_name("ALSA:capture_1").expect("lookup"), id);
    }

    #[test]
    fn input_resolution_follows_connection_count() {
        let types = builtin_port_types();
        let audio = &types[0];
        let mut mix = MixBuffers::default();

        let zero = vec![0f32; 128];
        let a = vec![0.25f32; 128];
        let b = vec![0.5f32; 128];
        let zero_buf = RawBuffer::from_slice(&zero);
        let a_buf = RawBuffer::from_slice(&a);
        let b_buf = RawBuffer::from_slice(&b);

        let resolved = mix.resolve_input(3, &[], audio, zero_buf, 128);
        assert_eq!(resolved.ptr(), zero_buf.ptr());

        let resolved = mix.resolve_input(3, &[a_buf], audio, zero_buf, 128);
        assert_eq!(resolved.ptr(), a_buf.ptr());

        let resolved = mix.resolve_input(3, &[a_buf, b_buf], audio, zero_buf, 128);
        assert_ne!(resolved.ptr(), a_buf.ptr());
        assert_ne!(resolved.ptr(), b_buf.ptr());
        let mixed = resolved.as_f32();
        assert!(mixed.iter().all(|s| (*s - 0.75).abs() < f32::EPSILON));
    }

    #[test]
    fn midi_merge_orders_by_time() {
        let mut a = vec![0u8; 256];
        let mut b = vec![0u8; 256];
        midi::buffer_init(&mut a, 128);
        midi::buffer_init(&mut b, 128);
        assert!(midi::write_event(&mut a, 10, &[0x90, 60, 100]));
        assert!(midi::write_event(&mut a, 50, &[0x80, 60, 0]));
        assert!(midi::write_event(&mut b, 20, &[0x90, 64, 100]));

        let mut merged = vec![0u8; 512];
        let sources = [RawBuffer::from_slice(&a), RawBuffer::from_slice(&b)];
        midi::mixdown(&mut merged, &sources, 128);

        let times: Vec<Frames> = midi::events(&merged).map(|(t, _)| t).collect();
        assert_eq!(times, vec![10, 20, 50]);
        let data: Vec<&[u8]> = midi::events(&merged).map(|(_, d)| d).collect();
        assert_eq!(data[1], &[0x90, 64, 100]);
    }
}
