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

//! The client library: connects to a running server over the request and
//! event sockets, attaches to the shared data plane and runs the process
//! thread that the engine chains into each cycle.

use crate::{
    config::ServerContext,
    error::{ClientError, ClientResult},
    fifo::{Fifo, PollOutcome},
    formats::{
        ClientId, FrameTime, Frames, PROTOCOL_VERSION, PortId, SampleRate, Uuid, from_fixed_str,
    },
    latency,
    metadata::{Property, PropertyChangeKind},
    port::MixBuffers,
    protocol::{
        self, ClientOpen, ClientOpenReply, ClientOptions, ClientStatus, Event, EventHello,
        LatencyMode, LatencyRange, PortFlags, Request, Response, callback_bits,
    },
    shm::{ClientControlShm, ControlShm, PortSegment, RawBuffer, client_state},
    time::get_microseconds,
    transport::{Position, TransportState},
};
use std::{
    collections::HashMap,
    io::Write,
    os::unix::net::UnixStream,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
};
use thread_priority::{
    NormalThreadSchedulePolicy, RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue,
    ThreadSchedulePolicy, set_thread_priority_and_policy, thread_native_id,
};
use tracing::{debug, info, warn};

/// Return value of the RT hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

impl Control {
    fn status(self) -> i32 {
        match self {
            Control::Continue => 0,
            Control::Quit => -1,
        }
    }
}

/// Non-RT notifications, all invoked on the client's event thread.
#[allow(unused_variables)]
pub trait NotificationHandler: Send {
    /// Called once when the process thread starts.
    fn thread_init(&mut self) {}

    /// The server went away, or zombified us. Executed from the event
    /// thread; set a flag or poke a pipe rather than doing real work.
    fn shutdown(&mut self, status: ClientStatus, reason: &str) {}

    fn freewheel(&mut self, is_enabled: bool) {}

    fn sample_rate(&mut self, srate: SampleRate) -> Control {
        Control::Continue
    }

    fn client_registration(&mut self, name: &str, is_registered: bool) {}

    fn port_registration(&mut self, port_id: PortId, is_registered: bool) {}

    fn port_rename(&mut self, port_id: PortId, old_name: &str, new_name: &str) -> Control {
        Control::Continue
    }

    fn ports_connected(&mut self, port_a: PortId, port_b: PortId, are_connected: bool) {}

    fn graph_reorder(&mut self) -> Control {
        Control::Continue
    }

    fn xrun(&mut self) -> Control {
        Control::Continue
    }

    /// Only invoked when [`NotificationHandler::handles_latency`] opts
    /// in; otherwise the engine runs its default latency propagation for
    /// this client.
    fn latency(&mut self, mode: LatencyMode) {}

    fn handles_latency(&self) -> bool {
        false
    }

    fn property_change(&mut self, subject: Uuid, key: Option<&str>, change: PropertyChangeKind) {}

    fn save_session(&mut self, path: &str) {}

    fn handles_session(&self) -> bool {
        false
    }
}

/// Empty handler for clients that only push audio.
pub struct SilentNotifications;

impl NotificationHandler for SilentNotifications {}

/// The RT hook, invoked once per cycle on the process thread.
pub trait ProcessHandler: Send {
    fn process(&mut self, scope: &ProcessScope) -> Control;

    fn buffer_size(&mut self, nframes: Frames) -> Control {
        let _ = nframes;
        Control::Continue
    }
}

/// Wraps a closure as a [`ProcessHandler`].
pub struct ClosureProcessHandler<F> {
    f: F,
}

impl<F> ClosureProcessHandler<F>
where
    F: FnMut(&ProcessScope) -> Control + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ProcessHandler for ClosureProcessHandler<F>
where
    F: FnMut(&ProcessScope) -> Control + Send,
{
    fn process(&mut self, scope: &ProcessScope) -> Control {
        (self.f)(scope)
    }
}

type SyncCallback = Box<dyn FnMut(TransportState, &Position) -> bool + Send>;
type TimebaseCallback = Box<dyn FnMut(TransportState, Frames, &mut Position, bool) + Send>;

/// How this client participates in the cycle: a per-period process
/// function the library invokes, or a client-owned thread that blocks in
/// `cycle_wait`/`cycle_signal` itself. Never both; both resolve to the
/// same wakeup → wait → signal pattern on the FIFO chain.
enum ProcessMode {
    Loop(Box<dyn ProcessHandler>),
    Owned {
        nframes_tx: crossbeam::channel::Sender<Frames>,
        status_rx: crossbeam::channel::Receiver<i32>,
    },
}

/// Cycle rendezvous for clients that run their own process thread.
pub struct CycleHandle {
    nframes_rx: crossbeam::channel::Receiver<Frames>,
    status_tx: crossbeam::channel::Sender<i32>,
    inner: Arc<ClientInner>,
}

impl CycleHandle {
    /// Blocks until the engine schedules the next cycle; `None` once the
    /// client is closed or zombified.
    pub fn cycle_wait(&self) -> Option<Frames> {
        self.nframes_rx.recv().ok()
    }

    /// Reports the cycle's process status back to the library, which
    /// signals the FIFO chain.
    pub fn cycle_signal(&self, status: i32) {
        self.status_tx.send(status).ok();
    }

    /// Buffer access for the cycle obtained from [`CycleHandle::cycle_wait`].
    pub fn scope(&self, nframes: Frames) -> ProcessScope<'_> {
        ProcessScope {
            nframes,
            frame_time: self.inner.engine_control.header().frame_timer.snapshot().0,
            inner: &self.inner,
        }
    }
}

struct ClientInner {
    name: String,
    client_id: ClientId,
    uuid: Uuid,
    fifo_prefix: String,
    realtime: bool,
    rt_priority: i32,
    request: Mutex<UnixStream>,
    event_shutdown: UnixStream,
    control: ClientControlShm,
    engine_control: ControlShm,
    segments: RwLock<Vec<Option<PortSegment>>>,
    own_ports: Mutex<Vec<PortId>>,
    /// Sources currently feeding each of our input ports. This is the
    /// per-port connection picture `port_get_buffer` resolves against,
    /// guarded so reads stay safe against concurrent connection events.
    input_sources: Mutex<HashMap<PortId, Vec<PortId>>>,
    mix: Mutex<MixBuffers>,
    notification: Mutex<Option<Box<dyn NotificationHandler>>>,
    process: Mutex<Option<ProcessMode>>,
    sync_callback: Mutex<Option<SyncCallback>>,
    timebase_callback: Mutex<Option<TimebaseCallback>>,
    reorder_tx: Mutex<Option<mpsc::Sender<u32>>>,
    running: AtomicBool,
    zombified: AtomicBool,
    rt_enabled: AtomicBool,
    timebase_unique: AtomicU64,
    last_position_unique: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn request(&self, request: &Request) -> ClientResult<Response> {
        if self.zombified.load(Ordering::Relaxed) {
            return Err(ClientError::Zombified);
        }
        let mut stream = self.request.lock().expect("request stream lock poisoned");
        protocol::write_frame_blocking(&mut *stream, request)?;
        let response: Response = protocol::read_frame_blocking(&mut *stream)?;
        if let Response::Error { code: _, message } = response {
            return Err(ClientError::RequestFailed(message));
        }
        Ok(response)
    }

    fn segment_buffer(&self, ptype: u32, offset: u32) -> Option<RawBuffer> {
        let segments = self.segments.read().expect("segment table lock poisoned");
        segments
            .get(ptype as usize)
            .and_then(Option::as_ref)
            .map(|s| s.buffer_at(offset))
    }

    fn zero_buffer(&self, ptype: u32) -> Option<RawBuffer> {
        let segments = self.segments.read().expect("segment table lock poisoned");
        segments
            .get(ptype as usize)
            .and_then(Option::as_ref)
            .map(|s| s.buffer_at(s.zero_offset()))
    }

    /// Resolves the buffer a port reads or writes this cycle.
    fn port_buffer(&self, port_id: PortId, nframes: Frames) -> Option<RawBuffer> {
        let shared = self.engine_control.port(port_id);
        if shared.in_use.load(Ordering::Acquire) == 0 {
            return None;
        }
        let ptype = shared.ptype_id;
        let flags = PortFlags::from_bits_truncate(shared.flags.load(Ordering::Relaxed));

        if flags.contains(PortFlags::IS_OUTPUT) {
            return self.segment_buffer(ptype, shared.offset.load(Ordering::Relaxed));
        }

        let sources: Vec<RawBuffer> = {
            let connections = self.input_sources.lock().expect("connection lock poisoned");
            connections
                .get(&port_id)
                .map(|sources| {
                    sources
                        .iter()
                        .filter_map(|src| {
                            let src_shared = self.engine_control.port(*src);
                            self.segment_buffer(
                                ptype,
                                src_shared.offset.load(Ordering::Relaxed),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let zero = self.zero_buffer(ptype)?;
        let type_info = crate::port::builtin_port_types().into_iter().nth(ptype as usize)?;
        let mut mix = self.mix.lock().expect("mix buffer lock poisoned");
        Some(mix.resolve_input(port_id, &sources, &type_info, zero, nframes))
    }
}

/// A connected but not yet activated client.
pub struct Client {
    inner: Arc<ClientInner>,
}

/// A client whose process thread is live in the scheduled graph.
pub struct ActiveClient {
    client: Client,
}

impl std::ops::Deref for ActiveClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Client {
    /// Connects to a running server and performs the open handshake.
    pub fn open(
        name: &str,
        options: ClientOptions,
        server_name: Option<&str>,
    ) -> ClientResult<(Client, ClientStatus)> {
        let context = ServerContext::for_server(server_name);
        let request_path = context.request_socket_path();
        let mut request = UnixStream::connect(&request_path).map_err(|_| {
            ClientError::ServerNotRunning(request_path.to_string_lossy().into_owned())
        })?;

        protocol::write_frame_blocking(
            &mut request,
            &ClientOpen {
                protocol_version: PROTOCOL_VERSION,
                name: name.to_owned(),
                options,
                uuid: None,
                session_id: None,
                pid: std::process::id(),
            },
        )?;
        let reply: ClientOpenReply = protocol::read_frame_blocking(&mut request)?;
        if reply.status.contains(ClientStatus::FAILURE) {
            return Err(ClientError::OpenFailed(reply.status));
        }

        let control = ClientControlShm::open(&reply.client_shm_id)?;
        let engine_control = ControlShm::open(&reply.control_shm_id)?;

        let mut event_stream = UnixStream::connect(context.event_socket_path())?;
        protocol::write_frame_blocking(
            &mut event_stream,
            &EventHello {
                client_id: reply.client_id,
            },
        )?;
        let event_shutdown = event_stream.try_clone()?;

        let inner = Arc::new(ClientInner {
            name: reply.name.clone(),
            client_id: reply.client_id,
            uuid: reply.uuid,
            fifo_prefix: reply.fifo_prefix.clone(),
            realtime: reply.realtime,
            rt_priority: reply.client_rt_priority,
            request: Mutex::new(request),
            event_shutdown,
            control,
            engine_control,
            segments: RwLock::new(Vec::new()),
            own_ports: Mutex::new(Vec::new()),
            input_sources: Mutex::new(HashMap::new()),
            mix: Mutex::new(MixBuffers::default()),
            notification: Mutex::new(None),
            process: Mutex::new(None),
            sync_callback: Mutex::new(None),
            timebase_callback: Mutex::new(None),
            reorder_tx: Mutex::new(None),
            running: AtomicBool::new(true),
            zombified: AtomicBool::new(false),
            rt_enabled: AtomicBool::new(true),
            timebase_unique: AtomicU64::new(0),
            last_position_unique: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        });

        {
            let thread_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("jack-events-{}", reply.name))
                .spawn(move || run_event_loop(&thread_inner, event_stream))?;
            inner_threads(&inner).push(handle);
        }

        info!("client '{}' connected (id {})", reply.name, reply.client_id);
        Ok((Client { inner }, reply.status))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.inner.engine_control.header().sample_rate_value()
    }

    pub fn buffer_size(&self) -> Frames {
        self.inner.engine_control.header().buffer_size_value()
    }

    pub fn cpu_load(&self) -> f32 {
        self.inner.engine_control.header().cpu_load_value()
    }

    pub fn frame_time(&self) -> FrameTime {
        self.inner.engine_control.header().frame_timer.snapshot().0
    }

    pub fn is_zombified(&self) -> bool {
        self.inner.zombified.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // ports

    pub fn register_port(
        &self,
        short_name: &str,
        type_name: &str,
        flags: PortFlags,
    ) -> ClientResult<Port> {
        let response = self.inner.request(&Request::RegisterPort {
            client_id: self.inner.client_id,
            short_name: short_name.to_owned(),
            type_name: type_name.to_owned(),
            flags,
            buffer_size_hint: 0,
        })?;
        let Response::PortId(port_id) = response else {
            return Err(ClientError::RequestFailed("unexpected response".to_owned()));
        };
        self.inner.own_ports.lock().expect("port list lock poisoned").push(port_id);
        Ok(Port {
            id: port_id,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn unregister_port(&self, port: Port) -> ClientResult<()> {
        self.inner.request(&Request::UnregisterPort {
            client_id: self.inner.client_id,
            port_id: port.id,
        })?;
        self.inner.own_ports.lock().expect("port list lock poisoned").retain(|p| *p != port.id);
        Ok(())
    }

    /// Looks a port up by name or alias directly in the shared registry.
    pub fn port_by_name(&self, name: &str) -> Option<Port> {
        let control = &self.inner.engine_control;
        let lookup = |wanted: &str| {
            for id in 0..control.port_max() {
                let shared = control.port(id);
                if shared.in_use.load(Ordering::Acquire) == 0 {
                    continue;
                }
                if from_fixed_str(&shared.name) == wanted
                    || from_fixed_str(&shared.alias1) == wanted
                    || from_fixed_str(&shared.alias2) == wanted
                {
                    return Some(id);
                }
            }
            None
        };
        let id = lookup(name).or_else(|| {
            name.strip_prefix("ALSA:")
                .and_then(|rest| lookup(&format!("alsa_pcm:{rest}")))
        })?;
        Some(Port {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn port_by_id(&self, id: PortId) -> Option<Port> {
        let shared = self.inner.engine_control.port(id);
        if shared.in_use.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(Port {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn connect_ports_by_name(&self, source: &str, destination: &str) -> ClientResult<()> {
        self.inner.request(&Request::ConnectPorts {
            source: source.to_owned(),
            destination: destination.to_owned(),
        })?;
        Ok(())
    }

    pub fn disconnect_ports_by_name(&self, source: &str, destination: &str) -> ClientResult<()> {
        self.inner.request(&Request::DisconnectPorts {
            source: source.to_owned(),
            destination: destination.to_owned(),
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Installs the handlers, tells the server we are ready to be
    /// scheduled and starts the process thread.
    pub fn activate(
        self,
        notification: impl NotificationHandler + 'static,
        process: impl ProcessHandler + 'static,
    ) -> ClientResult<ActiveClient> {
        self.install_mode(notification, ProcessMode::Loop(Box::new(process)), false)?;
        self.start_scheduling()
    }

    /// Like [`Client::activate`], but the client runs its own process
    /// loop: the engine's wakeups arrive through the [`CycleHandle`]
    /// passed to `thread`, which must call `cycle_wait`/`cycle_signal`
    /// once per cycle.
    pub fn activate_thread(
        self,
        notification: impl NotificationHandler + 'static,
        thread: impl FnOnce(CycleHandle) + Send + 'static,
    ) -> ClientResult<ActiveClient> {
        let (nframes_tx, nframes_rx) = crossbeam::channel::bounded(0);
        let (status_tx, status_rx) = crossbeam::channel::bounded(0);
        self.install_mode(
            notification,
            ProcessMode::Owned {
                nframes_tx,
                status_rx,
            },
            true,
        )?;
        {
            let handle_inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("jack-cycle-{}", self.inner.name))
                .spawn(move || {
                    thread(CycleHandle {
                        nframes_rx,
                        status_tx,
                        inner: handle_inner,
                    });
                })?;
            inner_threads(&self.inner).push(handle);
        }
        self.start_scheduling()
    }

    fn install_mode(
        &self,
        notification: impl NotificationHandler + 'static,
        mode: ProcessMode,
        owned: bool,
    ) -> ClientResult<()> {
        {
            let mut guard = self.inner.process.lock().expect("process handler lock poisoned");
            if guard.is_some() {
                return Err(ClientError::ProcessHandlerTaken);
            }
            *guard = Some(mode);
        }
        let mut callbacks = callback_bits::BUFFER_SIZE
            | callback_bits::SAMPLE_RATE
            | callback_bits::XRUN
            | callback_bits::PORT_REGISTER
            | callback_bits::PORT_CONNECT
            | callback_bits::CLIENT_REGISTER
            | callback_bits::GRAPH_ORDER
            | callback_bits::FREEWHEEL
            | callback_bits::PORT_RENAME
            | callback_bits::PROPERTY;
        callbacks |= if owned {
            callback_bits::THREAD
        } else {
            callback_bits::PROCESS
        };
        if notification.handles_latency() {
            callbacks |= callback_bits::LATENCY;
        }
        if notification.handles_session() {
            callbacks |= callback_bits::SESSION;
        }
        {
            let mut guard = self.inner.notification.lock().expect("notification handler lock poisoned");
            *guard = Some(Box::new(notification));
        }
        self.inner
            .control
            .control()
            .callbacks
            .store(callbacks, Ordering::Relaxed);
        Ok(())
    }

    fn start_scheduling(self) -> ClientResult<ActiveClient> {
        let (reorder_tx, reorder_rx) = mpsc::channel();
        {
            let mut guard = self.inner.reorder_tx.lock().expect("reorder channel lock poisoned");
            *guard = Some(reorder_tx);
        }
        {
            let thread_inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("jack-process-{}", self.inner.name))
                .spawn(move || run_process_loop(&thread_inner, &reorder_rx))?;
            inner_threads(&self.inner).push(handle);
        }

        self.inner.request(&Request::ActivateClient {
            client_id: self.inner.client_id,
        })?;
        Ok(ActiveClient { client: self })
    }

    pub fn freewheel(&self, enable: bool) -> ClientResult<()> {
        let request = if enable {
            Request::Freewheel {
                client_id: self.inner.client_id,
            }
        } else {
            Request::StopFreewheel {
                client_id: self.inner.client_id,
            }
        };
        self.inner.request(&request)?;
        Ok(())
    }

    pub fn set_buffer_size(&self, nframes: Frames) -> ClientResult<()> {
        self.inner.request(&Request::SetBufferSize { nframes })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // transport

    pub fn transport_query(&self) -> (TransportState, Position) {
        Position::snapshot(&self.inner.engine_control.header().transport)
    }

    pub fn transport_start(&self) -> ClientResult<()> {
        self.inner.request(&Request::TransportStart)?;
        Ok(())
    }

    pub fn transport_stop(&self) -> ClientResult<()> {
        self.inner.request(&Request::TransportStop)?;
        Ok(())
    }

    pub fn transport_locate(&self, frame: Frames) -> ClientResult<()> {
        self.inner.request(&Request::TransportLocate { frame })?;
        Ok(())
    }

    /// Registers this client as a slow-sync client: the transport will
    /// wait for its ready vote before rolling.
    pub fn set_sync_callback(
        &self,
        callback: impl FnMut(TransportState, &Position) -> bool + Send + 'static,
    ) -> ClientResult<()> {
        {
            let mut guard = self.inner.sync_callback.lock().expect("sync callback lock poisoned");
            *guard = Some(Box::new(callback));
        }
        self.inner
            .control
            .control()
            .set_callback(callback_bits::SYNC, true);
        self.inner.request(&Request::SetSyncClient {
            client_id: self.inner.client_id,
        })?;
        Ok(())
    }

    pub fn release_sync(&self) -> ClientResult<()> {
        self.inner
            .control
            .control()
            .set_callback(callback_bits::SYNC, false);
        {
            let mut guard = self.inner.sync_callback.lock().expect("sync callback lock poisoned");
            *guard = None;
        }
        self.inner.request(&Request::ResetSyncClient {
            client_id: self.inner.client_id,
        })?;
        Ok(())
    }

    /// Takes the timebase master role. With `conditional` set, fails if
    /// another master is already registered.
    pub fn set_timebase_callback(
        &self,
        conditional: bool,
        callback: impl FnMut(TransportState, Frames, &mut Position, bool) + Send + 'static,
    ) -> ClientResult<()> {
        self.inner.request(&Request::SetTimebaseClient {
            client_id: self.inner.client_id,
            conditional,
        })?;
        {
            let mut guard = self.inner.timebase_callback.lock().expect("timebase callback lock poisoned");
            *guard = Some(Box::new(callback));
        }
        self.inner
            .control
            .control()
            .set_callback(callback_bits::TIMEBASE, true);
        Ok(())
    }

    pub fn release_timebase(&self) -> ClientResult<()> {
        self.inner
            .control
            .control()
            .set_callback(callback_bits::TIMEBASE, false);
        {
            let mut guard = self.inner.timebase_callback.lock().expect("timebase callback lock poisoned");
            *guard = None;
        }
        self.inner.request(&Request::ResetTimebaseClient {
            client_id: self.inner.client_id,
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // metadata

    pub fn set_property(
        &self,
        subject: Uuid,
        key: &str,
        value: &str,
        value_type: Option<&str>,
    ) -> ClientResult<()> {
        self.inner.request(&Request::SetProperty {
            subject,
            key: key.to_owned(),
            value: value.to_owned(),
            value_type: value_type.map(ToOwned::to_owned),
        })?;
        Ok(())
    }

    pub fn get_property(&self, subject: Uuid, key: &str) -> ClientResult<Option<Property>> {
        match self.inner.request(&Request::GetProperty {
            subject,
            key: key.to_owned(),
        })? {
            Response::Property(property) => Ok(property),
            _ => Err(ClientError::RequestFailed("unexpected response".to_owned())),
        }
    }

    pub fn get_properties(&self, subject: Uuid) -> ClientResult<Vec<Property>> {
        match self.inner.request(&Request::GetProperties { subject })? {
            Response::Properties(properties) => Ok(properties),
            _ => Err(ClientError::RequestFailed("unexpected response".to_owned())),
        }
    }

    pub fn get_all_properties(&self) -> ClientResult<Vec<Property>> {
        match self.inner.request(&Request::GetAllProperties)? {
            Response::Properties(properties) => Ok(properties),
            _ => Err(ClientError::RequestFailed("unexpected response".to_owned())),
        }
    }

    pub fn remove_property(&self, subject: Uuid, key: &str) -> ClientResult<()> {
        self.inner.request(&Request::RemoveProperty {
            subject,
            key: key.to_owned(),
        })?;
        Ok(())
    }

    pub fn remove_properties(&self, subject: Uuid) -> ClientResult<u32> {
        match self.inner.request(&Request::RemoveProperties { subject })? {
            Response::RemovedCount(count) => Ok(count),
            _ => Err(ClientError::RequestFailed("unexpected response".to_owned())),
        }
    }

    pub fn remove_all_properties(&self) -> ClientResult<()> {
        self.inner.request(&Request::RemoveAllProperties)?;
        Ok(())
    }

    fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner
            .request(&Request::CloseClient {
                client_id: self.inner.client_id,
            })
            .ok();
        self.inner
            .event_shutdown
            .shutdown(std::net::Shutdown::Both)
            .ok();
        {
            // dropping an Owned mode's channels releases a client thread
            // blocked in cycle_wait
            let mut process = self.inner.process.lock().expect("process handler lock poisoned");
            *process = None;
        }
        let handles = {
            std::mem::take(&mut *self.inner.threads.lock().expect("thread registry lock poisoned"))
        };
        for handle in handles {
            handle.join().ok();
        }
        debug!("client '{}' closed", self.inner.name);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl ActiveClient {
    /// Takes the client out of the graph, keeping the connection open.
    pub fn deactivate(self) -> ClientResult<Client> {
        self.client.inner.request(&Request::DeactivateClient {
            client_id: self.client.inner.client_id,
        })?;
        Ok(self.client)
    }
}

fn inner_threads(inner: &ClientInner) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    inner.threads.lock().expect("thread registry lock poisoned")
}

/// One endpoint owned by this client (or a handle on somebody else's
/// port obtained through lookup).
#[derive(Clone)]
pub struct Port {
    id: PortId,
    inner: Arc<ClientInner>,
}

impl Port {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> String {
        from_fixed_str(&self.inner.engine_control.port(self.id).name)
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(
            self.inner
                .engine_control
                .port(self.id)
                .flags
                .load(Ordering::Relaxed),
        )
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.inner.engine_control.port(self.id).uuid)
    }

    pub fn get_latency_range(&self, mode: LatencyMode) -> LatencyRange {
        latency::get_range(self.inner.engine_control.port(self.id), mode)
    }

    pub fn set_latency_range(&self, mode: LatencyMode, range: LatencyRange) {
        latency::set_range(self.inner.engine_control.port(self.id), mode, range);
    }

    pub fn total_latency(&self) -> Frames {
        self.inner
            .engine_control
            .port(self.id)
            .total_latency
            .load(Ordering::Relaxed)
    }

    /// Names of the ports connected to this one, as the server sees it.
    pub fn get_connections(&self) -> ClientResult<Vec<String>> {
        match self
            .inner
            .request(&Request::GetPortConnections { port_id: self.id })?
        {
            Response::Connections(names) => Ok(names),
            _ => Err(ClientError::RequestFailed("unexpected response".to_owned())),
        }
    }

    pub fn request_monitor(&self, on: bool) {
        let shared = self.inner.engine_control.port(self.id);
        if on {
            shared.monitor_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            shared
                .monitor_requests
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(1))
                })
                .ok();
        }
    }
}

/// Buffer access for one process cycle.
pub struct ProcessScope<'a> {
    pub nframes: Frames,
    pub frame_time: FrameTime,
    inner: &'a ClientInner,
}

impl ProcessScope<'_> {
    /// Raw resolved buffer: arena slot for outputs; zero sentinel, the
    /// single source (zero copy), or the mix buffer for inputs.
    pub fn port_buffer(&self, port: &Port) -> Option<RawBuffer> {
        self.inner.port_buffer(port.id, self.nframes)
    }

    pub fn audio_in<'s>(&'s self, port: &Port) -> &'s [f32] {
        match self.port_buffer(port) {
            Some(buffer) => unsafe {
                std::slice::from_raw_parts(buffer.ptr() as *const f32, self.nframes as usize)
            },
            None => &[],
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn audio_out<'s>(&'s self, port: &Port) -> &'s mut [f32] {
        match self.port_buffer(port) {
            Some(buffer) => unsafe {
                std::slice::from_raw_parts_mut(buffer.ptr() as *mut f32, self.nframes as usize)
            },
            None => &mut [],
        }
    }
}

// ----------------------------------------------------------------------
// event thread

fn run_event_loop(inner: &Arc<ClientInner>, mut stream: UnixStream) {
    loop {
        let event: Event = match protocol::read_frame_blocking(&mut stream) {
            Ok(event) => event,
            Err(e) => {
                if inner.running.load(Ordering::Relaxed)
                    && !inner.zombified.load(Ordering::Relaxed)
                {
                    debug!("event channel closed: {e}");
                    zombify(inner, ClientStatus::FAILURE, "event channel closed");
                }
                return;
            }
        };
        let status = handle_event(inner, &event);
        if stream.write_all(&[status]).is_err() {
            return;
        }
    }
}

fn zombify(inner: &ClientInner, status: ClientStatus, reason: &str) {
    inner.zombified.store(true, Ordering::SeqCst);
    if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
        handler.shutdown(status, reason);
    }
}

fn handle_event(inner: &Arc<ClientInner>, event: &Event) -> u8 {
    match event {
        Event::AttachPortSegment {
            ptype_id,
            shm_id,
            buffer_bytes,
        } => {
            match PortSegment::open(shm_id, *buffer_bytes as usize) {
                Ok(segment) => {
                    let mut segments = inner.segments.write().expect("segment table lock poisoned");
                    let idx = *ptype_id as usize;
                    if segments.len() <= idx {
                        segments.resize_with(idx + 1, || None);
                    }
                    segments[idx] = Some(segment);
                    inner.mix.lock().expect("mix buffer lock poisoned").invalidate();
                    0
                }
                Err(e) => {
                    warn!("cannot attach port segment '{shm_id}': {e}");
                    1
                }
            }
        }
        Event::BufferSizeChange { nframes } => {
            inner.mix.lock().expect("mix buffer lock poisoned").invalidate();
            if let Some(ProcessMode::Loop(handler)) = inner.process.lock().expect("process handler lock poisoned").as_mut() {
                handler.buffer_size(*nframes);
            }
            0
        }
        Event::SampleRateChange { nframes } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.sample_rate(*nframes);
            }
            0
        }
        Event::GraphReordered {
            fifo_index,
            upstream_is_engine: _,
        } => {
            if let Some(tx) = inner.reorder_tx.lock().expect("reorder channel lock poisoned").as_ref() {
                tx.send(*fifo_index).ok();
            }
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.graph_reorder();
            }
            0
        }
        Event::PortConnected {
            source,
            destination,
        } => {
            update_connection(inner, *source, *destination, true);
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.ports_connected(*source, *destination, true);
            }
            0
        }
        Event::PortDisconnected {
            source,
            destination,
        } => {
            update_connection(inner, *source, *destination, false);
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.ports_connected(*source, *destination, false);
            }
            0
        }
        Event::PortRegistered { port_id } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.port_registration(*port_id, true);
            }
            0
        }
        Event::PortUnregistered { port_id } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.port_registration(*port_id, false);
            }
            0
        }
        Event::PortRename {
            port_id,
            old_name,
            new_name,
        } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.port_rename(*port_id, old_name, new_name);
            }
            0
        }
        Event::XRun => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.xrun();
            }
            0
        }
        Event::StartFreewheel => {
            // drop out of SCHED_FIFO while cycles are software driven
            inner.rt_enabled.store(false, Ordering::Relaxed);
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.freewheel(true);
            }
            0
        }
        Event::StopFreewheel => {
            inner.rt_enabled.store(true, Ordering::Relaxed);
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.freewheel(false);
            }
            0
        }
        Event::ClientRegistered { name, .. } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.client_registration(name, true);
            }
            0
        }
        Event::ClientUnregistered { name, .. } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.client_registration(name, false);
            }
            0
        }
        Event::SaveSession { path } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.save_session(path);
            }
            0
        }
        Event::LatencyCallback { mode } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.latency(*mode);
            }
            0
        }
        Event::PropertyChange {
            subject,
            key,
            change,
        } => {
            if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
                handler.property_change(*subject, key.as_deref(), *change);
            }
            0
        }
        Event::Shutdown { status, reason } => {
            zombify(inner, *status, reason);
            0
        }
    }
}

fn update_connection(inner: &ClientInner, source: PortId, destination: PortId, connected: bool) {
    let is_ours = inner.own_ports.lock().expect("port list lock poisoned").contains(&destination);
    if !is_ours {
        return;
    }
    let mut connections = inner.input_sources.lock().expect("connection lock poisoned");
    let sources = connections.entry(destination).or_default();
    if connected {
        if !sources.contains(&source) {
            sources.push(source);
        }
    } else {
        sources.retain(|s| *s != source);
    }
}

// ----------------------------------------------------------------------
// process thread

fn run_process_loop(inner: &Arc<ClientInner>, reorder_rx: &mpsc::Receiver<u32>) {
    {
        if let Some(handler) = inner.notification.lock().expect("notification handler lock poisoned").as_mut() {
            handler.thread_init();
        }
    }

    let mut rt_active = false;
    let mut fifos: Option<(Fifo, Fifo)> = None;

    while inner.running.load(Ordering::Relaxed) && !inner.zombified.load(Ordering::Relaxed) {
        let wants_rt = inner.realtime && inner.rt_enabled.load(Ordering::Relaxed);
        if wants_rt != rt_active {
            if wants_rt {
                set_process_thread_rt(inner.rt_priority);
            } else {
                set_process_thread_normal();
            }
            rt_active = wants_rt;
        }

        // pick up the newest rechain position
        let mut latest = None;
        while let Ok(index) = reorder_rx.try_recv() {
            latest = Some(index);
        }
        if fifos.is_none() && latest.is_none() {
            match reorder_rx.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(index) => latest = Some(index),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
        if let Some(index) = latest {
            match open_cycle_fifos(inner, index) {
                Ok(pair) => fifos = Some(pair),
                Err(e) => {
                    warn!("cannot open cycle fifos at index {index}: {e}");
                    fifos = None;
                    continue;
                }
            }
        }
        let Some((wait, next)) = fifos.as_ref() else {
            continue;
        };

        match wait.poll_readable(100) {
            Ok(PollOutcome::Readable) => {
                if !matches!(wait.try_read_byte(), Ok(true)) {
                    continue;
                }
                run_one_cycle(inner);
                if let Err(e) = next.write_byte() {
                    warn!("cannot signal cycle completion: {e}");
                }
            }
            Ok(PollOutcome::TimedOut) => {}
            Ok(PollOutcome::Lost) | Err(_) => {
                fifos = None;
            }
        }
    }
}

fn open_cycle_fifos(inner: &ClientInner, index: u32) -> std::io::Result<(Fifo, Fifo)> {
    let wait_path = format!("{}-{index}", inner.fifo_prefix);
    let next_path = format!("{}-{}", inner.fifo_prefix, index + 1);
    let wait = Fifo::open_nonblocking(std::path::Path::new(&wait_path))?;
    let next = Fifo::open_nonblocking(std::path::Path::new(&next_path))?;
    Ok((wait, next))
}

fn run_one_cycle(inner: &ClientInner) {
    let control = inner.control.control();
    if control.is_dead() {
        return;
    }
    control
        .state
        .store(client_state::RUNNING, Ordering::Relaxed);
    control
        .awake_at
        .store(get_microseconds(), Ordering::Relaxed);
    let nframes = control.nframes.load(Ordering::Relaxed);

    // slow-sync vote, if the transport is polling us
    if control.sync_poll.load(Ordering::Relaxed) != 0 {
        if let Some(callback) = inner.sync_callback.lock().expect("sync callback lock poisoned").as_mut() {
            let (state, position) =
                Position::snapshot(&inner.engine_control.header().transport);
            let ready = callback(state, &position);
            control
                .sync_ready
                .store(ready as u32, Ordering::Relaxed);
        }
    }

    let mut status = 0;
    {
        let mut process = inner.process.lock().expect("process handler lock poisoned");
        match process.as_mut() {
            Some(ProcessMode::Loop(handler)) => {
                let scope = ProcessScope {
                    nframes,
                    frame_time: inner.engine_control.header().frame_timer.snapshot().0,
                    inner,
                };
                status = handler.process(&scope).status();
            }
            Some(ProcessMode::Owned {
                nframes_tx,
                status_rx,
            }) => {
                // hand the cycle to the client-owned thread and wait for
                // its signal
                let timeout = std::time::Duration::from_millis(500);
                status = if nframes_tx.send_timeout(nframes, timeout).is_ok() {
                    status_rx.recv_timeout(timeout).unwrap_or(-1)
                } else {
                    -1
                };
            }
            None => {}
        }
    }
    control.last_status.store(status, Ordering::Relaxed);

    // a timebase master publishes the next BBT position
    if control.has_callback(callback_bits::TIMEBASE) {
        if let Some(callback) = inner.timebase_callback.lock().expect("timebase callback lock poisoned").as_mut() {
            let (state, mut position) =
                Position::snapshot(&inner.engine_control.header().transport);
            let new_pos = position.unique
                != inner.last_position_unique.swap(position.unique, Ordering::Relaxed);
            callback(state, nframes, &mut position, new_pos);
            position.unique = inner.timebase_unique.fetch_add(1, Ordering::Relaxed) + 1;
            position.publish(state, &inner.engine_control.header().transport_pending);
        }
    }

    control
        .finished_at
        .store(get_microseconds(), Ordering::Relaxed);
    control
        .state
        .store(client_state::FINISHED, Ordering::Relaxed);
}

fn set_process_thread_rt(priority: i32) {
    let tid = thread_native_id();
    let priority_value = u8::try_from(priority.max(1))
        .ok()
        .and_then(|p| ThreadPriorityValue::try_from(p).ok())
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Min);
    if let Err(e) = set_thread_priority_and_policy(
        tid,
        priority_value,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set process thread priority: {e}");
    }
}

fn set_process_thread_normal() {
    let tid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        tid,
        ThreadPriority::Min,
        ThreadSchedulePolicy::Normal(NormalThreadSchedulePolicy::Other),
    ) {
        warn!("Could not reset process thread priority: {e}");
    }
}
