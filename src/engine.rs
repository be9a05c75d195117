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

//! The engine: owner of the shared data plane, the graph and the cycle
//! executor. The server thread calls into the operations here under the
//! request lock; structural changes take the graph write lock, which the
//! cycle executor only ever tries from the read side.

pub mod cycle;

pub use cycle::ProcessContext;

use crate::{
    client::{
        ClientControlHandle, ClientInternal, ClientType, InternalHandler, Lifecycle,
        generate_unique_name, validate_client_name,
    },
    config::{Config, EngineConfig, ServerContext},
    driver::Driver,
    error::{EngineError, EngineResult},
    fifo::FifoRing,
    formats::{
        ClientId, FrameTime, Frames, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE, PortId, Uuid,
        to_fixed_str,
    },
    graph::Graph,
    latency,
    metadata::MetadataStore,
    port::{MixBuffers, PortTypeInfo, builtin_port_types},
    protocol::{
        self, ClientStatus, Event, LatencyMode, PortFlags, callback_bits,
    },
    shm::{ClientControlShared, ClientControlShm, ControlShm, PortSegment, client_state},
    time::FrameTimer,
    transport::TransportEngine,
};
use cycle::{CpuLoad, DriverCommand};
use crossbeam::channel::Sender as CrossbeamSender;
use std::sync::{
    Arc, Condvar, Mutex, RwLock,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Why the server thread is being poked from the RT path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    /// Scan clients and zombify/remove offenders.
    Problems,
    /// The driver is gone; shut the server down in an orderly way.
    DriverExit,
    /// The last external client left a temporary server.
    Temporary,
}

pub(crate) struct FreewheelState {
    pub active: AtomicBool,
    pub stopping: AtomicBool,
    pub client: AtomicU32,
    pub thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

pub struct Engine {
    pub config: EngineConfig,
    pub context: ServerContext,
    pub control: ControlShm,
    pub port_types: Vec<PortTypeInfo>,
    pub graph: RwLock<Graph>,
    pub segments: RwLock<Vec<PortSegment>>,
    pub fifos: Mutex<FifoRing>,
    pub transport: Mutex<TransportEngine>,
    pub metadata: MetadataStore,
    pub frame_timer: Mutex<FrameTimer>,
    pub(crate) cpu: Mutex<CpuLoad>,
    /// Mix buffers for inputs the engine itself resolves (internal
    /// clients and driver playback ports).
    pub(crate) mix: Mutex<MixBuffers>,
    pub problems: Mutex<u32>,
    signal_tx: mpsc::UnboundedSender<EngineSignal>,
    pub(crate) driver_cmd_tx: Mutex<Option<CrossbeamSender<DriverCommand>>>,
    pub(crate) freewheel: FreewheelState,
    /// Parks the driver thread while freewheeling.
    pub(crate) driver_park: (Mutex<bool>, Condvar),
    pub watchdog_check: AtomicU32,
    pub(crate) driver_running: AtomicBool,
    pub(crate) last_master_unique: AtomicU64,
    next_client_id: AtomicU32,
    segment_generation: AtomicU64,
    pub shutting_down: AtomicBool,
    /// Spare time estimate of the last load measurement, consumed by the
    /// delay check.
    pub(crate) spare_usecs: AtomicU32,
}

impl Engine {
    pub fn new(config: &Config) -> EngineResult<(Arc<Engine>, mpsc::UnboundedReceiver<EngineSignal>)> {
        let context = config.server_context();
        std::fs::create_dir_all(context.server_dir())?;

        let port_types = builtin_port_types();
        let control = ControlShm::create(&context.control_shm_id(), config.engine.port_max)?;

        let header = control.header();
        header
            .n_port_types
            .store(port_types.len() as u32, Ordering::Relaxed);
        for (i, t) in port_types.iter().enumerate() {
            let entry = &header.port_types[i];
            #[allow(invalid_reference_casting)]
            unsafe {
                let entry_mut = &mut *(std::ptr::from_ref(entry).cast_mut());
                entry_mut.name = to_fixed_str(t.name);
                entry_mut.scale = t.scale;
                entry_mut.has_mixdown = t.has_mixdown() as u32;
            }
        }
        header.client_priority.store(
            if config.engine.realtime {
                config.engine.rt_priority as i32 - 5
            } else {
                0
            },
            Ordering::Relaxed,
        );
        header.max_client_priority.store(
            if config.engine.realtime {
                config.engine.rt_priority as i32 - 1
            } else {
                0
            },
            Ordering::Relaxed,
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let n_types = port_types.len();
        let engine = Arc::new(Engine {
            config: config.engine.clone(),
            context: context.clone(),
            control,
            port_types,
            graph: RwLock::new(Graph::new(config.engine.port_max, n_types)),
            segments: RwLock::new(Vec::new()),
            fifos: Mutex::new(FifoRing::new(context.clone())),
            transport: Mutex::new(TransportEngine::new(config.driver.sample_rate)),
            metadata: MetadataStore::new(Some(context.metadata_path())),
            frame_timer: Mutex::new(FrameTimer::new(0)),
            cpu: Mutex::new(CpuLoad::default()),
            mix: Mutex::new(MixBuffers::default()),
            problems: Mutex::new(0),
            signal_tx,
            driver_cmd_tx: Mutex::new(None),
            freewheel: FreewheelState {
                active: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                client: AtomicU32::new(0),
                thread: Mutex::new(None),
            },
            driver_park: (Mutex::new(false), Condvar::new()),
            watchdog_check: AtomicU32::new(0),
            driver_running: AtomicBool::new(false),
            last_master_unique: AtomicU64::new(0),
            next_client_id: AtomicU32::new(1),
            segment_generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            spare_usecs: AtomicU32::new(0),
        });

        if config.engine.memory_lock {
            lock_memory();
        }

        info!(
            "Engine '{}' up, {} ports max",
            context.server_name(),
            config.engine.port_max
        );
        Ok((engine, signal_rx))
    }

    pub fn signal(&self, signal: EngineSignal) {
        self.signal_tx.send(signal).ok();
    }

    pub fn signal_problems(&self) {
        {
            *self.problems.lock().expect("problem lock poisoned") += 1;
        }
        self.signal(EngineSignal::Problems);
    }

    fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn type_id_by_name(&self, name: &str) -> EngineResult<u32> {
        self.port_types
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| EngineError::UnknownPortType(name.to_owned()))
    }

    // ------------------------------------------------------------------
    // buffer arenas

    /// (Re)creates every port type arena for the given buffer size and
    /// publishes the new layout. Existing clients are told to re-attach
    /// through `AttachPortSegment` events, which the caller emits.
    fn rebuild_segments(&self, nframes: Frames) -> EngineResult<()> {
        let generation = self.segment_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let port_max = self.control.port_max();
        let mut segments = Vec::with_capacity(self.port_types.len());
        for (i, t) in self.port_types.iter().enumerate() {
            let buffer_bytes = t.buffer_bytes(nframes);
            let shm_id = self.context.port_segment_shm_id(i as u32, generation);
            let segment = PortSegment::create(&shm_id, port_max, buffer_bytes)?;
            segment.clear_zero_buffer();
            let entry = &self.control.header().port_types[i];
            entry
                .buffer_bytes
                .store(buffer_bytes as u32, Ordering::Relaxed);
            entry
                .zero_offset
                .store(segment.zero_offset(), Ordering::Relaxed);
            entry.segment_generation.store(generation, Ordering::Relaxed);
            segments.push(segment);
        }
        {
            *self.segments.write().expect("segment table lock poisoned") = segments;
        }
        Ok(())
    }

    pub fn segment_shm_id(&self, ptype: u32) -> String {
        let generation = self.control.header().port_types[ptype as usize]
            .segment_generation
            .load(Ordering::Relaxed);
        self.context.port_segment_shm_id(ptype, generation)
    }

    fn attach_events_for(&self, ptype_filter: Option<u32>) -> Vec<Event> {
        let mut events = Vec::new();
        for (i, _) in self.port_types.iter().enumerate() {
            if ptype_filter.is_some_and(|f| f != i as u32) {
                continue;
            }
            let entry = &self.control.header().port_types[i];
            events.push(Event::AttachPortSegment {
                ptype_id: i as u32,
                shm_id: self.segment_shm_id(i as u32),
                buffer_bytes: entry.buffer_bytes.load(Ordering::Relaxed),
            });
        }
        events
    }

    // ------------------------------------------------------------------
    // event fan-out

    /// Whether this event is gated behind a callback-presence bit, and
    /// which one.
    fn event_bit(event: &Event) -> Option<u32> {
        match event {
            Event::PortRegistered { .. } | Event::PortUnregistered { .. } => {
                Some(callback_bits::PORT_REGISTER)
            }
            Event::PortConnected { .. } | Event::PortDisconnected { .. } => {
                Some(callback_bits::PORT_CONNECT)
            }
            Event::ClientRegistered { .. } | Event::ClientUnregistered { .. } => {
                Some(callback_bits::CLIENT_REGISTER)
            }
            Event::PortRename { .. } => Some(callback_bits::PORT_RENAME),
            Event::PropertyChange { .. } => Some(callback_bits::PROPERTY),
            Event::SaveSession { .. } => Some(callback_bits::SESSION),
            Event::LatencyCallback { .. } => Some(callback_bits::LATENCY),
            _ => None,
        }
    }

    /// Delivers one event, honoring the client's callback bits, and
    /// charges failed deliveries against its error counter.
    pub fn deliver_event(&self, graph: &Graph, client_id: ClientId, event: &Event) -> bool {
        let Ok(client) = graph.client(client_id) else {
            return false;
        };
        if client.control().is_dead() {
            return true;
        }
        if let Some(bit) = Self::event_bit(event)
            && !client.control().has_callback(bit)
        {
            return true;
        }
        match client.deliver_event(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("event delivery to '{}' failed: {e}", client.name);
                false
            }
        }
    }

    /// Like [`Engine::deliver_event`], but charges a failed delivery
    /// against the client's error counter and signals problems.
    pub fn deliver_event_checked(&self, graph: &Graph, client_id: ClientId, event: &Event) {
        if !self.deliver_event(graph, client_id, event)
            && let Ok(client) = graph.client(client_id)
        {
            client.add_error(crate::formats::SOCKET_ERROR_WEIGHT);
            self.signal_problems();
        }
    }

    /// Delivery that bypasses the callback-bit gate. Connection changes
    /// must reach the involved port owners unconditionally: their buffer
    /// resolution depends on an accurate connection picture.
    fn deliver_event_forced(&self, graph: &Graph, client_id: ClientId, event: &Event) {
        let Ok(client) = graph.client(client_id) else {
            return;
        };
        if client.control().is_dead() {
            return;
        }
        if let Err(e) = client.deliver_event(event) {
            warn!("event delivery to '{}' failed: {e}", client.name);
            client.add_error(crate::formats::SOCKET_ERROR_WEIGHT);
            self.signal_problems();
        }
    }

    pub fn deliver_event_to_all(&self, graph: &Graph, event: &Event) {
        for client_id in &graph.order {
            self.deliver_event_checked(graph, *client_id, event);
        }
    }

    fn broadcast_excluding(&self, graph: &Graph, event: &Event, excluded: &[ClientId]) {
        for client_id in &graph.order {
            if excluded.contains(client_id) {
                continue;
            }
            self.deliver_event_checked(graph, *client_id, event);
        }
    }

    // ------------------------------------------------------------------
    // sorting and latency

    /// Re-sorts the graph, rechains the FIFO plan, recomputes latencies
    /// and delivers the resulting events. Caller holds the graph write
    /// lock.
    pub fn sort_graph(&self, graph: &mut Graph) {
        graph.sort_clients();
        latency::compute_all_port_total_latencies(graph, &self.control);
        let reorder_events = {
            let mut fifos = self.fifos.lock().expect("fifo ring lock poisoned");
            match graph.rechain(&mut fifos) {
                Ok(events) => events,
                Err(e) => {
                    warn!("rechain failed: {e}");
                    Vec::new()
                }
            }
        };
        for (client_id, event) in reorder_events {
            // fifo plumbing must reach every external client, callback
            // bit or not
            self.deliver_event_checked(graph, client_id, &event);
        }
        self.compute_new_latency(graph);
    }

    /// Capture pass in forward graph order, playback pass in reverse,
    /// drivers included. Clients without a latency callback get the
    /// engine's default propagation.
    pub fn compute_new_latency(&self, graph: &mut Graph) {
        let order = graph.order.clone();
        for client_id in &order {
            self.latency_pass_for(graph, *client_id, LatencyMode::Capture);
        }
        for client_id in order.iter().rev() {
            self.latency_pass_for(graph, *client_id, LatencyMode::Playback);
        }
        latency::compute_all_port_total_latencies(graph, &self.control);
    }

    fn latency_pass_for(&self, graph: &mut Graph, client_id: ClientId, mode: LatencyMode) {
        latency::aggregate_client_edges(graph, &self.control, client_id, mode);
        let has_callback = graph
            .client(client_id)
            .map(|c| c.control().has_callback(callback_bits::LATENCY))
            .unwrap_or(false);
        if has_callback {
            self.deliver_event_checked(graph, client_id, &Event::LatencyCallback { mode });
        } else {
            latency::default_client_propagation(graph, &self.control, client_id, mode);
        }
    }

    // ------------------------------------------------------------------
    // client manager

    fn resolve_client_name(
        &self,
        graph: &mut Graph,
        requested: &str,
        options: protocol::ClientOptions,
        uuid: Uuid,
    ) -> Result<String, ClientStatus> {
        if let Some(reserved) = graph.take_reserved_name(uuid) {
            return Ok(reserved);
        }
        if !validate_client_name(requested) {
            return Err(ClientStatus::FAILURE | ClientStatus::INVALID_OPTION);
        }
        if options.contains(protocol::ClientOptions::USE_EXACT_NAME) {
            if graph.name_taken(requested) {
                return Err(ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE);
            }
            return Ok(requested.to_owned());
        }
        generate_unique_name(requested, |n| graph.name_taken(n))
            .ok_or(ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE)
    }

    fn insert_client(&self, graph: &mut Graph, client: ClientInternal) {
        let event = Event::ClientRegistered {
            name: client.name.clone(),
            uuid: client.uuid,
        };
        graph.add_client(client);
        self.deliver_event_to_all(graph, &event);
    }

    /// Admits an external client. Returns everything the client library
    /// needs to attach.
    pub fn create_external_client(
        &self,
        requested_name: &str,
        options: protocol::ClientOptions,
        uuid: Option<Uuid>,
        pid: u32,
    ) -> Result<protocol::ClientOpenReply, ClientStatus> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let uuid = uuid.unwrap_or_else(Uuid::generate);
        let name = self.resolve_client_name(&mut graph, requested_name, options, uuid)?;

        let id = self.next_client_id();
        let shm_id = self.context.client_shm_id(id);
        let shm = ClientControlShm::create(&shm_id).map_err(|e| {
            warn!("client control shm failed: {e}");
            ClientStatus::FAILURE | ClientStatus::SHM_FAILURE
        })?;
        {
            let control = unsafe { shm.control_mut() };
            control.id = id;
            control.pid = pid;
            control.uuid = uuid.to_bytes();
            control.client_type = ClientType::External.to_u32();
            control.name = to_fixed_str(&name);
        }

        let client = ClientInternal {
            id,
            uuid,
            name: name.clone(),
            ctype: ClientType::External,
            control: ClientControlHandle::Shm(shm),
            shm_id: Some(shm_id.clone()),
            lifecycle: Lifecycle::Allocated,
            handler: None,
            event_stream: None,
            error: std::sync::atomic::AtomicU32::new(0),
            session_reply_pending: false,
            sortfeeds: Vec::new(),
            truefeeds: Vec::new(),
            fedcount: 0,
            tfedcount: 0,
            execution_order: 0,
            subgraph_start_fifo: None,
            subgraph_wait_fifo: None,
            deferred_port_events: Vec::new(),
        };
        self.insert_client(&mut graph, client);
        info!("new external client '{name}' (id {id})");

        Ok(protocol::ClientOpenReply {
            status: ClientStatus::empty(),
            client_id: id,
            uuid,
            name,
            engine_pid: std::process::id(),
            port_max: self.control.port_max(),
            control_shm_id: self.context.control_shm_id(),
            client_shm_id: shm_id,
            fifo_prefix: self.context.fifo_prefix(std::process::id()),
            client_rt_priority: self.control.header().client_priority.load(Ordering::Relaxed),
            realtime: self.config.realtime,
        })
    }

    /// Admits an in-process client with direct-call hooks.
    pub fn create_internal_client(
        &self,
        requested_name: &str,
        handler: Box<dyn InternalHandler>,
        callbacks: u32,
    ) -> EngineResult<ClientId> {
        self.create_in_process_client(requested_name, ClientType::Internal, Some(handler), callbacks)
    }

    fn create_in_process_client(
        &self,
        requested_name: &str,
        ctype: ClientType,
        handler: Option<Box<dyn InternalHandler>>,
        callbacks: u32,
    ) -> EngineResult<ClientId> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let uuid = Uuid::generate();
        let name = self
            .resolve_client_name(&mut graph, requested_name, protocol::ClientOptions::empty(), uuid)
            .map_err(|_| EngineError::NameNotUnique(requested_name.to_owned()))?;

        let id = self.next_client_id();
        let control = ClientControlShared {
            id,
            pid: std::process::id(),
            uuid: uuid.to_bytes(),
            client_type: ctype.to_u32(),
            name: to_fixed_str(&name),
            ..Default::default()
        };
        control.callbacks.store(callbacks, Ordering::Relaxed);

        let client = ClientInternal {
            id,
            uuid,
            name: name.clone(),
            ctype,
            control: ClientControlHandle::Heap(Box::new(control)),
            shm_id: None,
            lifecycle: Lifecycle::Allocated,
            handler: handler.map(Mutex::new),
            event_stream: None,
            error: std::sync::atomic::AtomicU32::new(0),
            session_reply_pending: false,
            sortfeeds: Vec::new(),
            truefeeds: Vec::new(),
            fedcount: 0,
            tfedcount: 0,
            execution_order: 0,
            subgraph_start_fifo: None,
            subgraph_wait_fifo: None,
            deferred_port_events: Vec::new(),
        };
        self.insert_client(&mut graph, client);
        info!("new {ctype:?} client '{name}' (id {id})");
        Ok(id)
    }

    #[instrument(skip(self))]
    pub fn activate_client(&self, client_id: ClientId) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        {
            let client = graph.client_mut(client_id)?;
            client.lifecycle = Lifecycle::Active;
            client.control().active.store(1, Ordering::Relaxed);
            client
                .control()
                .state
                .store(client_state::NOT_TRIGGERED, Ordering::Relaxed);
        }
        self.sort_graph(&mut graph);

        // segment attachments, the current buffer size, then the port
        // registrations held back while the client was inactive
        let mut events = self.attach_events_for(None);
        events.push(Event::BufferSizeChange {
            nframes: self.control.header().buffer_size_value(),
        });
        let deferred = {
            let client = graph.client_mut(client_id)?;
            std::mem::take(&mut client.deferred_port_events)
        };
        for event in events.iter().chain(deferred.iter()) {
            self.deliver_event_checked(&graph, client_id, event);
        }
        for event in deferred {
            // everyone else with the callback hears about the ports now
            self.broadcast_excluding(&mut graph, &event, &[client_id]);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn deactivate_client(&self, client_id: ClientId) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        self.do_deactivate(&mut graph, client_id, true)
    }

    fn do_deactivate(
        &self,
        graph: &mut Graph,
        client_id: ClientId,
        sort: bool,
    ) -> EngineResult<()> {
        {
            let client = graph.client_mut(client_id)?;
            client.control().active.store(0, Ordering::Relaxed);
            if client.lifecycle == Lifecycle::Active {
                client.lifecycle = Lifecycle::Allocated;
            }
        }
        self.transport.lock().expect("transport lock poisoned").client_exit(client_id);
        if sort {
            self.sort_graph(graph);
        }
        Ok(())
    }

    /// Marks a client dead and detaches it from the graph without
    /// freeing it, so further errors can be surfaced before removal.
    pub fn zombify_client(&self, graph: &mut Graph, client_id: ClientId) -> EngineResult<()> {
        info!("zombifying client {client_id}");
        {
            let client = graph.client_mut(client_id)?;
            client.control().dead.store(1, Ordering::Relaxed);
            client.lifecycle = Lifecycle::Dead;
        }
        graph.disconnect_client_ports(&self.control, client_id)?;
        self.do_deactivate(graph, client_id, false)?;

        if self.freewheel.active.load(Ordering::Relaxed)
            && self.freewheel.client.load(Ordering::Relaxed) == client_id
        {
            self.freewheel.stopping.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fully removes a client: ports unregistered, sockets closed,
    /// resources freed.
    pub fn remove_client(&self, graph: &mut Graph, client_id: ClientId) -> EngineResult<()> {
        {
            let is_dead = graph.client(client_id)?.control().is_dead();
            if !is_dead {
                self.zombify_client(graph, client_id)?;
            }
        }

        for port_id in graph.ports.ports_of_client(client_id) {
            graph.disconnect_all(&self.control, port_id)?;
            graph.ports.unregister(&self.control, port_id)?;
            self.deliver_event_to_all(graph, &Event::PortUnregistered { port_id });
        }

        let Some(client) = graph.take_client(client_id) else {
            return Err(EngineError::UnknownClient(client_id.to_string()));
        };
        info!("removing client '{}'", client.name);
        let event = Event::ClientUnregistered {
            name: client.name.clone(),
            uuid: client.uuid,
        };
        drop(client); // closes sockets and frees the control block
        self.deliver_event_to_all(graph, &event);
        self.sort_graph(graph);

        if self.config.temporary && graph.external_client_count() == 0 {
            info!("temporary server: last external client left");
            self.signal(EngineSignal::Temporary);
        }
        Ok(())
    }

    /// Zombifies or removes every client whose error counter crossed the
    /// line. Runs on the server thread in response to a problem signal.
    pub fn handle_problem_clients(&self) {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        {
            *self.problems.lock().expect("problem lock poisoned") = 0;
        }

        let offenders: Vec<(ClientId, u32, bool)> = graph
            .clients_iter()
            .filter(|c| c.error_count() > 0)
            .map(|c| (c.id, c.error_count(), c.control().is_dead()))
            .collect();

        let mut sorted = false;
        for (client_id, error, dead) in offenders {
            if error >= crate::formats::ERROR_REMOVE_THRESHOLD {
                let _ = graph.client(client_id).map(|c| {
                    self.send_shutdown_event(c, ClientStatus::CLIENT_ZOMBIE, "client failure")
                });
                if let Err(e) = self.remove_client(&mut graph, client_id) {
                    warn!("could not remove client {client_id}: {e}");
                }
                sorted = true;
            } else if !dead {
                let _ = graph.client(client_id).map(|c| {
                    self.send_shutdown_event(c, ClientStatus::CLIENT_ZOMBIE, "client errors")
                });
                if let Err(e) = self.zombify_client(&mut graph, client_id) {
                    warn!("could not zombify client {client_id}: {e}");
                }
                sorted = true;
            }
        }
        if sorted {
            self.sort_graph(&mut graph);
        }
    }

    fn send_shutdown_event(&self, client: &ClientInternal, status: ClientStatus, reason: &str) {
        let event = Event::Shutdown {
            status,
            reason: reason.to_owned(),
        };
        if let Err(e) = client.deliver_event(&event) {
            debug!("shutdown event for '{}' not delivered: {e}", client.name);
        }
    }

    /// Orderly engine shutdown: tell every client, then mark the control
    /// block dead.
    pub fn shutdown(&self, status: ClientStatus, reason: &str) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutdown: {reason}");
        self.control.header().engine_ok.store(0, Ordering::SeqCst);
        let graph = self.graph.read().expect("graph lock poisoned");
        for client in graph.clients_in_order() {
            if client.ctype == ClientType::External {
                self.send_shutdown_event(client, status, reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // ports and connections

    pub fn set_client_callbacks(&self, client_id: ClientId, callbacks: u32) -> EngineResult<()> {
        let graph = self.graph.read().expect("graph lock poisoned");
        graph
            .client(client_id)?
            .control()
            .callbacks
            .store(callbacks, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn register_port(
        &self,
        client_id: ClientId,
        short_name: &str,
        type_name: &str,
        flags: PortFlags,
        _buffer_size_hint: u32,
    ) -> EngineResult<PortId> {
        let ptype = self.type_id_by_name(type_name)?;
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let (client_name, client_uuid, canonicalize, active) = {
            let client = graph.client(client_id)?;
            (
                client.name.clone(),
                client.uuid,
                client.is_driver(),
                client.is_active(),
            )
        };
        let port_id = graph.ports.register(
            &self.control,
            client_id,
            client_uuid,
            &client_name,
            short_name,
            ptype,
            &self.port_types[ptype as usize],
            flags,
            canonicalize,
        )?;

        let event = Event::PortRegistered { port_id };
        if active {
            self.deliver_event_to_all(&mut graph, &event);
        } else {
            // held back until activation, then re-emitted
            graph.client_mut(client_id)?.deferred_port_events.push(event);
        }
        Ok(port_id)
    }

    #[instrument(skip(self))]
    pub fn unregister_port(&self, client_id: ClientId, port_id: PortId) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let effects = graph.disconnect_all(&self.control, port_id)?;
        for effect in &effects {
            self.notify_disconnection(&mut graph, effect);
        }
        graph.ports.unregister(&self.control, port_id)?;
        self.deliver_event_to_all(&mut graph, &Event::PortUnregistered { port_id });
        if !effects.is_empty() {
            self.sort_graph(&mut graph);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn connect_ports(&self, source: &str, destination: &str) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let effect = graph.connect(&self.port_types, source, destination)?;

        // involved owners first, then everyone else who cares
        let event = Event::PortConnected {
            source: effect.src,
            destination: effect.dst,
        };
        self.deliver_event_forced(&graph, effect.src_client, &event);
        if effect.dst_client != effect.src_client {
            self.deliver_event_forced(&graph, effect.dst_client, &event);
        }
        self.broadcast_excluding(
            &mut graph,
            &event,
            &[effect.src_client, effect.dst_client],
        );
        self.sort_graph(&mut graph);
        Ok(())
    }

    fn notify_disconnection(&self, graph: &mut Graph, effect: &crate::graph::ConnectionEffect) {
        let event = Event::PortDisconnected {
            source: effect.src,
            destination: effect.dst,
        };
        self.deliver_event_forced(graph, effect.src_client, &event);
        if effect.dst_client != effect.src_client {
            self.deliver_event_forced(graph, effect.dst_client, &event);
        }
        self.broadcast_excluding(graph, &event, &[effect.src_client, effect.dst_client]);
    }

    #[instrument(skip(self))]
    pub fn disconnect_ports(&self, source: &str, destination: &str) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let effect = graph.disconnect(&self.control, source, destination)?;
        self.notify_disconnection(&mut graph, &effect);
        self.sort_graph(&mut graph);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn disconnect_port_all(&self, port_id: PortId) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let effects = graph.disconnect_all(&self.control, port_id)?;
        for effect in &effects {
            self.notify_disconnection(&mut graph, effect);
        }
        self.sort_graph(&mut graph);
        Ok(())
    }

    pub fn rename_port(
        &self,
        client_id: ClientId,
        port_id: PortId,
        short_name: &str,
    ) -> EngineResult<()> {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        let client_name = graph.client(client_id)?.name.clone();
        let (old_name, new_name) = graph
            .ports
            .rename(&self.control, port_id, &client_name, short_name)?;
        let event = Event::PortRename {
            port_id,
            old_name,
            new_name,
        };
        self.deliver_event_to_all(&mut graph, &event);
        Ok(())
    }

    // ------------------------------------------------------------------
    // buffer size

    #[instrument(skip(self))]
    pub fn set_buffer_size(&self, nframes: Frames) -> EngineResult<()> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&nframes) {
            return Err(EngineError::BufferSizeOutOfRange(nframes));
        }
        if !nframes.is_power_of_two() {
            return Err(EngineError::BufferSizeNotPowerOfTwo(nframes));
        }

        let mut graph = self.graph.write().expect("graph lock poisoned");
        self.rebuild_segments(nframes)?;
        self.control
            .header()
            .buffer_size
            .store(nframes, Ordering::Relaxed);
        graph.ports.republish_offsets(&self.control);
        if let Some(tx) = &*self.driver_cmd_tx.lock().expect("driver command lock poisoned") {
            tx.send(DriverCommand::SetBufferSize(nframes)).ok();
        }
        self.mix.lock().expect("mix buffer lock poisoned").invalidate();

        // attach first so clients re-resolve addresses before they see
        // the new size
        let mut events = self.attach_events_for(None);
        events.push(Event::BufferSizeChange { nframes });
        for event in &events {
            self.deliver_event_to_all(&mut graph, event);
        }
        self.compute_new_latency(&mut graph);
        info!("buffer size is now {nframes}");
        Ok(())
    }

    /// First-time setup when the driver attaches: publishes rate and
    /// buffer size and builds the arenas without event traffic (no
    /// clients exist yet).
    pub fn init_driver_timing(&self, sample_rate: u32, buffer_size: Frames) -> EngineResult<()> {
        self.rebuild_segments(buffer_size)?;
        let header = self.control.header();
        header.buffer_size.store(buffer_size, Ordering::Relaxed);
        header.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.transport.lock().expect("transport lock poisoned").set_sample_rate(sample_rate);
        header.engine_ok.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// Creates the driver's client and registers its physical ports.
    pub fn attach_driver(&self, driver: &mut dyn Driver) -> EngineResult<ClientId> {
        self.init_driver_timing(driver.sample_rate(), driver.buffer_size())?;
        let client_id = self.create_in_process_client(
            driver.name(),
            ClientType::Driver,
            None,
            0,
        )?;

        let mut capture = Vec::new();
        let mut playback = Vec::new();
        for spec in driver.port_specs() {
            let port_id = self.register_port(
                client_id,
                &spec.short_name,
                &spec.type_name,
                spec.flags,
                0,
            )?;
            let shared = self.control.port(port_id);
            if spec.flags.contains(PortFlags::IS_OUTPUT) {
                latency::set_range(shared, LatencyMode::Capture, spec.latency);
                capture.push(port_id);
            } else {
                latency::set_range(shared, LatencyMode::Playback, spec.latency);
                playback.push(port_id);
            }
        }
        driver.set_ports(capture, playback);

        {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let client = graph.client_mut(client_id)?;
            client.lifecycle = Lifecycle::Active;
            client.control().active.store(1, Ordering::Relaxed);
            self.sort_graph(&mut graph);
        }
        Ok(client_id)
    }

    // ------------------------------------------------------------------
    // transport plumbing

    pub fn transport_start(&self) {
        self.transport.lock().expect("transport lock poisoned").start();
    }

    pub fn transport_stop(&self) {
        self.transport.lock().expect("transport lock poisoned").stop();
    }

    pub fn transport_locate(&self, frame: Frames) {
        self.transport.lock().expect("transport lock poisoned").locate(frame);
    }

    pub fn frame_time(&self) -> FrameTime {
        self.control.header().frame_timer.snapshot().0
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.control.header().engine_ok.store(0, Ordering::SeqCst);
    }
}

fn lock_memory() {
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        warn!(
            "could not lock memory: {}",
            std::io::Error::last_os_error()
        );
    } else {
        info!("memory locked");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::DriverConfig,
        driver::{ManualDriver, ManualDriverHandle},
        shm::RawBuffer,
    };
    use super::cycle::{CycleOutcome, DriverSet, ProcessContext};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Config {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut config = Config::default();
        config.engine.server_name = format!("engine-test-{}-{n}", std::process::id());
        config.engine.tmpdir = Some(std::env::temp_dir());
        config.engine.realtime = false;
        config.engine.watchdog = false;
        config.engine.port_max = 32;
        config.driver = DriverConfig {
            sample_rate: 48_000,
            buffer_size: 128,
            capture_channels: 2,
            playback_channels: 2,
        };
        config
    }

    fn test_engine() -> (Arc<Engine>, DriverSet, ManualDriverHandle) {
        let config = test_config();
        let (engine, _signal_rx) = Engine::new(&config).expect("engine failed");
        let (mut driver, handle) = ManualDriver::new(48_000, 128, 2, 2);
        engine.attach_driver(&mut driver).expect("attach failed");
        (engine, DriverSet::new(Box::new(driver)), handle)
    }

    /// Copies its input to its output and records the resolved input
    /// buffer address.
    struct PassThrough {
        ports: Arc<Mutex<(PortId, PortId)>>,
        seen_input_ptr: Arc<AtomicUsize>,
        seen_input_value: Arc<Mutex<f32>>,
    }

    impl InternalHandler for PassThrough {
        fn process(&mut self, ctx: &mut ProcessContext) -> i32 {
            let (input, output) = *self.ports.lock().expect("port cell poisoned");
            let Some(in_buf) = ctx.input_buffer(input) else {
                return 1;
            };
            let Some(out_buf) = ctx.output_buffer(output) else {
                return 1;
            };
            self.seen_input_ptr.store(in_buf.ptr(), Ordering::Relaxed);
            {
                *self.seen_input_value.lock().expect("probe cell poisoned") = in_buf.as_f32()[0];
            }
            let samples = in_buf.as_f32();
            let out = unsafe { out_buf.as_f32_mut() };
            out[..ctx.nframes as usize].copy_from_slice(&samples[..ctx.nframes as usize]);
            0
        }
    }

    struct PassState {
        seen_input_ptr: Arc<AtomicUsize>,
        seen_input_value: Arc<Mutex<f32>>,
    }

    fn add_pass_client(engine: &Arc<Engine>, name: &str) -> (ClientId, PassState, PortId, PortId) {
        let ports = Arc::new(Mutex::new((0, 0)));
        let seen_input_ptr = Arc::new(AtomicUsize::new(0));
        let seen_input_value = Arc::new(Mutex::new(0.0f32));
        let handler = PassThrough {
            ports: Arc::clone(&ports),
            seen_input_ptr: Arc::clone(&seen_input_ptr),
            seen_input_value: Arc::clone(&seen_input_value),
        };
        let client_id = engine
            .create_internal_client(name, Box::new(handler), callback_bits::PROCESS)
            .expect("client failed");
        let input = engine
            .register_port(client_id, "in", crate::formats::AUDIO_TYPE_NAME, PortFlags::IS_INPUT, 0)
            .expect("input failed");
        let output = engine
            .register_port(
                client_id,
                "out",
                crate::formats::AUDIO_TYPE_NAME,
                PortFlags::IS_OUTPUT,
                0,
            )
            .expect("output failed");
        {
            *ports.lock().expect("port cell poisoned") = (input, output);
        }
        engine.activate_client(client_id).expect("activate failed");
        (
            client_id,
            PassState {
                seen_input_ptr,
                seen_input_value,
            },
            input,
            output,
        )
    }

    fn arena_buffer(engine: &Engine, port_id: PortId) -> RawBuffer {
        let segments = engine.segments.read().expect("segment table lock poisoned");
        let shared = engine.control.port(port_id);
        segments[shared.ptype_id as usize]
            .buffer_at(shared.offset.load(Ordering::Relaxed))
    }

    #[test]
    fn capture_playback_passthrough_is_zero_copy() {
        let (engine, mut drivers, handle) = test_engine();
        let (_, state, _, _) = add_pass_client(&engine, "pass");

        engine
            .connect_ports("system:capture_1", "pass:in")
            .expect("capture connect failed");
        engine
            .connect_ports("pass:out", "system:playback_1")
            .expect("playback connect failed");

        assert_eq!(
            engine.run_single_cycle(&mut drivers, 128),
            CycleOutcome::Ok
        );

        // single connection: the client reads the capture buffer in place
        let capture_id = {
            let graph = engine.graph.read().expect("graph lock poisoned");
            graph.ports.find_by_name("system:capture_1").expect("port")
        };
        let capture_buf = arena_buffer(&engine, capture_id);
        assert_eq!(
            state.seen_input_ptr.load(Ordering::Relaxed),
            capture_buf.ptr()
        );
        {
            assert!((*state.seen_input_value.lock().expect("probe cell poisoned") - 0.5).abs() < f32::EPSILON);
        }

        // and the playback side got the copy
        let written = handle.written();
        assert!(written[0].iter().all(|s| (*s - 0.5).abs() < f32::EPSILON));
    }

    #[test]
    fn mixdown_sums_two_captures() {
        let (engine, mut drivers, _handle) = test_engine();
        let (_, state, _, _) = add_pass_client(&engine, "pass");

        engine
            .connect_ports("system:capture_1", "pass:in")
            .expect("first connect failed");
        engine
            .connect_ports("system:capture_2", "pass:in")
            .expect("second connect failed");

        assert_eq!(
            engine.run_single_cycle(&mut drivers, 128),
            CycleOutcome::Ok
        );

        // the resolved input is a mix buffer distinct from both captures
        let (c1, c2) = {
            let graph = engine.graph.read().expect("graph lock poisoned");
            (
                graph.ports.find_by_name("system:capture_1").expect("c1"),
                graph.ports.find_by_name("system:capture_2").expect("c2"),
            )
        };
        let seen = state.seen_input_ptr.load(Ordering::Relaxed);
        assert_ne!(seen, arena_buffer(&engine, c1).ptr());
        assert_ne!(seen, arena_buffer(&engine, c2).ptr());
        {
            assert!((*state.seen_input_value.lock().expect("probe cell poisoned") - 1.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn graph_reorder_runs_upstream_first() {
        let (engine, mut drivers, _handle) = test_engine();
        let (a_id, _a_state, _a_in, a_out) = add_pass_client(&engine, "a");
        let (b_id, b_state, _b_in, _b_out) = add_pass_client(&engine, "b");

        engine.connect_ports("a:out", "b:in").expect("connect failed");

        {
            let graph = engine.graph.read().expect("graph lock poisoned");
            let a_pos = graph.order.iter().position(|c| *c == a_id).expect("a");
            let b_pos = graph.order.iter().position(|c| *c == b_id).expect("b");
            assert!(a_pos < b_pos);
        }

        assert_eq!(
            engine.run_single_cycle(&mut drivers, 128),
            CycleOutcome::Ok
        );
        // zero copy from a's output into b's input
        assert_eq!(
            b_state.seen_input_ptr.load(Ordering::Relaxed),
            arena_buffer(&engine, a_out).ptr()
        );

        // every process-bearing client finished the cycle
        let graph = engine.graph.read().expect("graph lock poisoned");
        for client in graph.clients_in_order() {
            if client.has_process_chain() && client.is_active() {
                assert_eq!(
                    client.control().state.load(Ordering::Relaxed),
                    client_state::FINISHED
                );
            }
        }
    }

    #[test]
    fn feedback_connection_is_accepted_and_keeps_order() {
        let (engine, mut drivers, _handle) = test_engine();
        let (a_id, _a, _, _) = add_pass_client(&engine, "a");
        let (b_id, _b, _, _) = add_pass_client(&engine, "b");

        engine.connect_ports("a:out", "b:in").expect("forward failed");
        engine.connect_ports("b:out", "a:in").expect("feedback refused");

        let graph = engine.graph.read().expect("graph lock poisoned");
        assert_eq!(graph.feedback_count, 1);
        let a_pos = graph.order.iter().position(|c| *c == a_id).expect("a");
        let b_pos = graph.order.iter().position(|c| *c == b_id).expect("b");
        assert!(a_pos < b_pos);
        drop(graph);

        assert_eq!(
            engine.run_single_cycle(&mut drivers, 128),
            CycleOutcome::Ok
        );
    }

    #[test]
    fn buffer_size_boundaries_are_enforced() {
        let (engine, _drivers, _handle) = test_engine();
        assert!(matches!(
            engine.set_buffer_size(100),
            Err(EngineError::BufferSizeNotPowerOfTwo(100))
        ));
        assert!(matches!(
            engine.set_buffer_size(32_768),
            Err(EngineError::BufferSizeOutOfRange(_))
        ));
        engine.set_buffer_size(256).expect("legal size refused");
        assert_eq!(engine.control.header().buffer_size_value(), 256);
    }

    #[test]
    fn unregister_port_restores_registry_state() {
        let (engine, _drivers, _handle) = test_engine();
        let (client_id, _, input, _) = add_pass_client(&engine, "pass");

        let free_before = {
            let graph = engine.graph.read().expect("graph lock poisoned");
            graph.ports.free_slot_count(0)
        };
        engine
            .unregister_port(client_id, input)
            .expect("unregister failed");
        assert_eq!(engine.control.port(input).in_use.load(Ordering::Relaxed), 0);
        let graph = engine.graph.read().expect("graph lock poisoned");
        // the input held no arena slot, so the freelist is unchanged
        assert_eq!(graph.ports.free_slot_count(0), free_before);
    }

    #[test]
    fn zombify_clears_connections_and_marks_dead() {
        let (engine, _drivers, _handle) = test_engine();
        let (client_id, _, input, _) = add_pass_client(&engine, "pass");
        engine
            .connect_ports("system:capture_1", "pass:in")
            .expect("connect failed");

        let mut graph = engine.graph.write().expect("graph lock poisoned");
        engine.zombify_client(&mut graph, client_id).expect("zombify failed");
        let client = graph.client(client_id).expect("client");
        assert!(client.control().is_dead());
        assert!(graph.ports.get(input).expect("port").incoming.is_empty());
    }
}
