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

//! The cycle executor: one period of work per driver wakeup. Runs on the
//! RT driver thread (or the non-RT freewheel thread). Nothing here may
//! block except the driver's hardware wait and the poll on a subgraph's
//! terminal FIFO.

use crate::{
    client::{ClientInternal, ClientType},
    driver::Driver,
    engine::{Engine, EngineSignal},
    error::DriverResult,
    formats::{
        ClientId, ENGINE_ROLLING_COUNT, ENGINE_ROLLING_INTERVAL, FREEWHEEL_POLL_TIMEOUT_USECS,
        FrameTime, Frames, MAX_CONSECUTIVE_EXCESSIVE_DELAYS, PortId, Usecs, WATCHDOG_TIMEOUT_MS,
        WORK_SCALE,
    },
    fifo::PollOutcome,
    graph::Graph,
    port::MixBuffers,
    protocol::{Event, callback_bits},
    shm::{PortSegment, RawBuffer, client_state},
    time::get_microseconds,
    transport::Position,
};
use crossbeam::channel::{Receiver, unbounded};
use std::sync::{
    Arc,
    atomic::Ordering,
};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub enum DriverCommand {
    SetBufferSize(Frames),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Ok,
    /// Lock contention or pending problems; the period was consumed
    /// without running clients.
    Null,
    /// Excessive wakeup delay; the cycle was abandoned and clients told.
    Abandoned,
    /// Too many consecutive excessive delays; the engine pauses.
    Pause,
    /// A driver operation failed.
    DriverFailure,
}

/// The master driver plus any slaves. Slaves read and write before the
/// master, start/stop symmetrically.
pub struct DriverSet {
    pub master: Box<dyn Driver>,
    pub slaves: Vec<Box<dyn Driver>>,
}

impl DriverSet {
    pub fn new(master: Box<dyn Driver>) -> Self {
        Self {
            master,
            slaves: Vec::new(),
        }
    }

    fn start_all(&mut self) -> DriverResult<()> {
        for slave in &mut self.slaves {
            slave.start()?;
        }
        self.master.start()
    }

    fn stop_all(&mut self) {
        for slave in &mut self.slaves {
            if let Err(e) = slave.stop() {
                warn!("slave driver stop failed: {e}");
            }
        }
        if let Err(e) = self.master.stop() {
            warn!("driver stop failed: {e}");
        }
    }

    fn read_all(&mut self, engine: &Engine, graph: &Graph, nframes: Frames) -> DriverResult<()> {
        for slave in &mut self.slaves {
            let capture = engine.driver_capture_buffers(graph, slave.as_ref());
            slave.read(&capture, nframes)?;
        }
        let capture = engine.driver_capture_buffers(graph, self.master.as_ref());
        self.master.read(&capture, nframes)
    }

    fn write_all(&mut self, engine: &Engine, graph: &Graph, nframes: Frames) -> DriverResult<()> {
        for slave in &mut self.slaves {
            let playback = engine.driver_playback_buffers(graph, slave.as_ref());
            slave.write(&playback, nframes)?;
        }
        let playback = engine.driver_playback_buffers(graph, self.master.as_ref());
        self.master.write(&playback, nframes)
    }

    fn null_all(&mut self, nframes: Frames) {
        for slave in &mut self.slaves {
            slave.null_cycle(nframes).ok();
        }
        self.master.null_cycle(nframes).ok();
    }
}

/// Rolling maximum filter over recent cycle execution times, folded into
/// the EMA the control block publishes.
pub struct CpuLoad {
    rolling: [Usecs; ENGINE_ROLLING_COUNT],
    index: usize,
    count: usize,
    max_usecs: f32,
    load: f32,
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self {
            rolling: [0; ENGINE_ROLLING_COUNT],
            index: 0,
            count: 0,
            max_usecs: 0.0,
            load: 0.0,
        }
    }
}

impl CpuLoad {
    /// Returns (load, spare_usecs) when a new estimate is due.
    pub fn update(&mut self, cycle_usecs: Usecs, period_usecs: f32) -> Option<(f32, f32)> {
        self.rolling[self.index] = cycle_usecs;
        self.index = (self.index + 1) % ENGINE_ROLLING_COUNT;
        self.count += 1;
        if self.count % ENGINE_ROLLING_INTERVAL != 0 {
            return None;
        }

        let max_usecs = self.rolling.iter().copied().max().unwrap_or(0) as f32;
        if max_usecs > self.max_usecs {
            self.max_usecs = max_usecs;
        }
        let spare = if max_usecs < period_usecs {
            period_usecs - max_usecs
        } else {
            0.0
        };
        self.load = (1.0 - spare / period_usecs) * 50.0 + self.load * 0.5;
        Some((self.load, spare))
    }
}

/// Driver-thread-local loop state.
pub(crate) struct CycleState {
    consecutive_excessive_delays: u32,
}

/// Per-cycle buffer access handed to internal clients' process hooks.
pub struct ProcessContext<'a> {
    pub nframes: Frames,
    pub frame_time: FrameTime,
    graph: &'a Graph,
    engine: &'a Engine,
    segments: &'a [PortSegment],
    mix: &'a mut MixBuffers,
}

impl ProcessContext<'_> {
    /// Buffer of one of the client's output ports.
    pub fn output_buffer(&self, port_id: PortId) -> Option<RawBuffer> {
        let port = self.graph.ports.get(port_id).ok()?;
        if !port.is_output() {
            return None;
        }
        let shared = self.engine.control.port(port_id);
        let segment = self.segments.get(port.ptype as usize)?;
        Some(segment.buffer_at(shared.offset.load(Ordering::Relaxed)))
    }

    /// Resolved buffer of one of the client's input ports: the zero
    /// sentinel, the single source's buffer, or the mix buffer.
    pub fn input_buffer(&mut self, port_id: PortId) -> Option<RawBuffer> {
        let port = self.graph.ports.get(port_id).ok()?;
        if !port.is_input() {
            return None;
        }
        let segment = self.segments.get(port.ptype as usize)?;
        let sources: Vec<RawBuffer> = self
            .graph
            .input_sources(port)
            .into_iter()
            .map(|src| {
                let offset = self.engine.control.port(src).offset.load(Ordering::Relaxed);
                segment.buffer_at(offset)
            })
            .collect();
        let zero = segment.buffer_at(segment.zero_offset());
        Some(self.mix.resolve_input(
            port_id,
            &sources,
            &self.engine.port_types[port.ptype as usize],
            zero,
            self.nframes,
        ))
    }
}

impl Engine {
    // ------------------------------------------------------------------
    // driver thread

    /// Spawns the RT driver thread. Returns once the thread is running;
    /// the thread exits on engine shutdown or fatal driver failure.
    pub fn start_driver_thread(
        self: &Arc<Self>,
        mut drivers: DriverSet,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let (cmd_tx, cmd_rx) = unbounded();
        {
            *self.driver_cmd_tx.lock().expect("driver command lock poisoned") = Some(cmd_tx);
        }
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("jackd-rs-driver".to_owned())
            .spawn(move || {
                if engine.config.realtime {
                    set_realtime_priority(engine.config.rt_priority);
                }
                engine.driver_loop(&mut drivers, &cmd_rx);
                drivers.stop_all();
                engine.driver_running.store(false, Ordering::Relaxed);
                if !engine.shutting_down.load(Ordering::Relaxed) {
                    engine.signal(EngineSignal::DriverExit);
                }
            })
    }

    fn driver_loop(self: &Arc<Self>, drivers: &mut DriverSet, commands: &Receiver<DriverCommand>) {
        if let Err(e) = drivers.start_all() {
            error!("driver start failed: {e}");
            return;
        }
        self.driver_running.store(true, Ordering::Relaxed);
        let mut state = CycleState {
            consecutive_excessive_delays: 0,
        };

        while !self.shutting_down.load(Ordering::Relaxed) {
            // park while the freewheel thread owns the cycle
            if self.freewheel.active.load(Ordering::Relaxed) {
                drivers.stop_all();
                let (lock, condvar) = &self.driver_park;
                {
                    let mut parked = lock.lock().expect("driver park lock poisoned");
                    while *parked {
                        parked = condvar.wait(parked).expect("driver park lock poisoned");
                    }
                }
                if self.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = drivers.start_all() {
                    error!("driver restart after freewheel failed: {e}");
                    return;
                }
                continue;
            }

            while let Ok(command) = commands.try_recv() {
                match command {
                    DriverCommand::SetBufferSize(nframes) => {
                        if let Err(e) = drivers.master.buffer_size_changed(nframes) {
                            warn!("driver rejected buffer size {nframes}: {e}");
                        }
                        for slave in &mut drivers.slaves {
                            slave.buffer_size_changed(nframes).ok();
                        }
                    }
                }
            }

            let wait = match drivers.master.wait() {
                Ok(wait) => wait,
                Err(e) => {
                    if self.shutting_down.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("driver wait failed: {e}");
                    break;
                }
            };
            self.watchdog_check.store(1, Ordering::Relaxed);

            match self.run_cycle(drivers, wait.nframes, wait.delayed_usecs, &mut state) {
                CycleOutcome::Pause => {
                    error!("too many consecutive interrupt delays, engine pausing");
                    break;
                }
                CycleOutcome::DriverFailure => {
                    error!("cycle execution failure, exiting");
                    break;
                }
                _ => {}
            }
        }
    }

    /// One driver wakeup: advance the frame timer, then run as many
    /// engine cycles as it takes to consume `nframes`. The frame timer
    /// moves once per wakeup, not per sub-cycle.
    fn run_cycle(
        &self,
        drivers: &mut DriverSet,
        nframes: Frames,
        delayed_usecs: f32,
        state: &mut CycleState,
    ) -> CycleOutcome {
        let buffer_size = self.control.header().buffer_size_value();
        let period_usecs = drivers.master.period_usecs();
        let now = drivers.master.last_wait_ust();

        {
            let mut timer = self.frame_timer.lock().expect("frame timer lock poisoned");
            timer.cycle_begin(now, period_usecs, nframes);
            self.control.header().frame_timer.publish(
                timer.frames,
                timer.current_wakeup,
                timer.next_wakeup,
            );
        }

        if nframes != buffer_size {
            debug!("late driver wakeup: {nframes} frames to process");
        }

        let mut left = nframes;
        while left >= buffer_size {
            let outcome = self.run_one_cycle(Some(drivers), buffer_size, delayed_usecs, state);
            match outcome {
                CycleOutcome::Ok | CycleOutcome::Null | CycleOutcome::Abandoned => {}
                other => return other,
            }
            left -= buffer_size;
        }
        CycleOutcome::Ok
    }

    /// One engine cycle over `nframes`. `drivers` is `None` while
    /// freewheeling.
    pub(crate) fn run_one_cycle(
        &self,
        mut drivers: Option<&mut DriverSet>,
        nframes: Frames,
        delayed_usecs: f32,
        state: &mut CycleState,
    ) -> CycleOutcome {
        let freewheeling = drivers.is_none();
        let spare = f32::from_bits(self.spare_usecs.load(Ordering::Relaxed));

        if !freewheeling
            && self.config.realtime
            && spare > 0.0
            && delayed_usecs >= WORK_SCALE * spare
        {
            warn!(
                "delay of {delayed_usecs:.3} usecs exceeds estimated spare time of {:.3}; restart",
                WORK_SCALE * spare
            );
            state.consecutive_excessive_delays += 1;
            if state.consecutive_excessive_delays > MAX_CONSECUTIVE_EXCESSIVE_DELAYS {
                return CycleOutcome::Pause;
            }
            self.engine_delay(delayed_usecs);
            return CycleOutcome::Abandoned;
        }
        state.consecutive_excessive_delays = 0;

        let Ok(graph) = self.graph.try_read() else {
            debug!("lock-driven null cycle");
            if let Some(drivers) = drivers.as_mut() {
                drivers.null_all(nframes);
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            return CycleOutcome::Null;
        };

        let problems = {
            *self.problems.lock().expect("problem lock poisoned")
        };
        if problems > 0 {
            debug!("problem-driven null cycle, problems={problems}");
            if let Some(drivers) = drivers.as_mut() {
                drivers.null_all(nframes);
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            return CycleOutcome::Null;
        }

        let cycle_start = if let Some(drivers) = drivers.as_ref() {
            drivers.master.last_wait_ust()
        } else {
            get_microseconds()
        };
        let period_usecs = if let Some(drivers) = drivers.as_ref() {
            drivers.master.period_usecs()
        } else {
            crate::formats::period_usecs(nframes, self.control.header().sample_rate_value())
        };

        if let Some(drivers) = drivers.as_mut()
            && let Err(e) = drivers.read_all(self, &graph, nframes)
        {
            warn!("driver read failed: {e}");
            return CycleOutcome::DriverFailure;
        }

        let process_errors = self.engine_process(&graph, nframes, freewheeling, period_usecs);
        if process_errors {
            debug!("engine process cycle failed");
            self.check_clients(&graph, true);
        }

        if let Some(drivers) = drivers.as_mut()
            && let Err(e) = drivers.write_all(self, &graph, nframes)
        {
            warn!("driver write failed: {e}");
            return CycleOutcome::DriverFailure;
        }

        self.post_process(&graph, nframes, cycle_start, period_usecs);

        if delayed_usecs > f32::from_bits(
            self.control.header().max_delayed_usecs.load(Ordering::Relaxed),
        ) {
            self.control
                .header()
                .max_delayed_usecs
                .store(delayed_usecs.to_bits(), Ordering::Relaxed);
        }

        CycleOutcome::Ok
    }

    /// An excessive wakeup delay: mark the frame timer for reset and tell
    /// every client about the xrun.
    pub fn engine_delay(&self, delayed_usecs: f32) {
        {
            let mut timer = self.frame_timer.lock().expect("frame timer lock poisoned");
            timer.reset();
        }
        let header = self.control.header();
        header.xruns.fetch_add(1, Ordering::Relaxed);
        header
            .xrun_delayed_usecs
            .store(delayed_usecs.to_bits(), Ordering::Relaxed);
        if delayed_usecs > f32::from_bits(header.max_delayed_usecs.load(Ordering::Relaxed)) {
            header
                .max_delayed_usecs
                .store(delayed_usecs.to_bits(), Ordering::Relaxed);
        }

        let graph = self.graph.read().expect("graph lock poisoned");
        for client_id in &graph.order {
            self.deliver_event_checked(&graph, *client_id, &Event::XRun);
        }
    }

    // ------------------------------------------------------------------
    // client processing

    /// Walks the sorted list once. Internal clients run by direct call;
    /// each external subgraph is released through its head's start FIFO
    /// and awaited on the head's wait FIFO.
    fn engine_process(
        &self,
        graph: &Graph,
        nframes: Frames,
        freewheeling: bool,
        period_usecs: f32,
    ) -> bool {
        let mut process_errors = 0u32;

        for client in graph.clients_in_order() {
            let control = client.control();
            control
                .state
                .store(client_state::NOT_TRIGGERED, Ordering::Relaxed);
            control.nframes.store(nframes, Ordering::Relaxed);
            control.timed_out.store(0, Ordering::Relaxed);
            control.awake_at.store(0, Ordering::Relaxed);
            control.finished_at.store(0, Ordering::Relaxed);
        }

        let order = &graph.order;
        let mut index = 0;
        while index < order.len() && process_errors == 0 {
            let Ok(client) = graph.client(order[index]) else {
                index += 1;
                continue;
            };
            if !client.is_active() || client.control().is_dead() || !client.has_process_chain() {
                index += 1;
                continue;
            }
            if client.is_internal() {
                process_errors += self.process_internal(graph, client, nframes);
                index += 1;
            } else {
                process_errors += self.process_external_subgraph(graph, client, freewheeling, period_usecs);
                // skip to the next internal client; the subgraph wait
                // covered everything in between
                index += 1;
                while index < order.len() {
                    let Ok(next) = graph.client(order[index]) else {
                        break;
                    };
                    if next.is_internal() {
                        break;
                    }
                    index += 1;
                }
            }
        }

        process_errors > 0
    }

    fn process_internal(&self, graph: &Graph, client: &ClientInternal, nframes: Frames) -> u32 {
        let control = client.control();
        control.state.store(client_state::RUNNING, Ordering::Relaxed);
        control
            .awake_at
            .store(get_microseconds(), Ordering::Relaxed);

        let mut errors = 0;
        if let Some(handler) = &client.handler {
            let mut handler = handler.lock().expect("handler lock poisoned");

            if control.has_callback(callback_bits::SYNC) {
                let pending = {
                    let transport = self.transport.lock().expect("transport lock poisoned");
                    transport.sync_poll_pending(client.id)
                };
                if pending {
                    let (state, position) = {
                        let transport = self.transport.lock().expect("transport lock poisoned");
                        (transport.state(), transport.position())
                    };
                    let ready = handler.sync(state, &position);
                    self.transport
                        .lock()
                        .expect("transport lock poisoned")
                        .sync_client_report(client.id, ready);
                }
            }

            if control.has_callback(callback_bits::PROCESS) {
                let segments = {
                    self.segments.read().expect("segment table lock poisoned")
                };
                let mut mix = self.mix.lock().expect("mix buffer lock poisoned");
                let frame_time = self.control.header().frame_timer.snapshot().0;
                let mut ctx = ProcessContext {
                    nframes,
                    frame_time,
                    graph,
                    engine: self,
                    segments: &segments,
                    mix: &mut mix,
                };
                let status = handler.process(&mut ctx);
                control.last_status.store(status, Ordering::Relaxed);
                if status != 0 {
                    warn!("internal client '{}' failed", client.name);
                    client.add_error(1);
                    errors += 1;
                }
            }

            if control.has_callback(callback_bits::TIMEBASE) {
                let is_master = {
                    let transport = self.transport.lock().expect("transport lock poisoned");
                    transport.timebase_master() == Some(client.id)
                };
                if is_master {
                    let (state, mut position, new_pos) = {
                        let transport = self.transport.lock().expect("transport lock poisoned");
                        (transport.state(), transport.position(), transport.new_pos())
                    };
                    handler.timebase(state, nframes, &mut position, new_pos);
                    self.transport.lock().expect("transport lock poisoned").master_update(position);
                }
            }
        }

        control
            .finished_at
            .store(get_microseconds(), Ordering::Relaxed);
        control
            .state
            .store(client_state::FINISHED, Ordering::Relaxed);
        errors
    }

    /// Releases the subgraph headed by `client` and waits for its
    /// terminal FIFO. Returns the number of process errors.
    fn process_external_subgraph(
        &self,
        graph: &Graph,
        client: &ClientInternal,
        freewheeling: bool,
        period_usecs: f32,
    ) -> u32 {
        let control = client.control();
        let (Some(start_idx), Some(wait_idx)) =
            (client.subgraph_start_fifo, client.subgraph_wait_fifo)
        else {
            // rechain pending; treat as a null client
            return 0;
        };

        // a race exists if we set this after the write
        control.state.store(client_state::TRIGGERED, Ordering::Relaxed);
        control
            .signalled_at
            .store(get_microseconds(), Ordering::Relaxed);

        let fifos = self.fifos.lock().expect("fifo ring lock poisoned");
        let Some(start) = fifos.get(start_idx) else {
            return 0;
        };
        let Some(wait) = fifos.get(wait_idx) else {
            return 0;
        };

        debug!(
            "triggering subgraph at '{}' (start fifo {start_idx})",
            client.name
        );
        if let Err(e) = start.write_byte() {
            warn!("cannot initiate graph processing: {e}");
            self.signal_problems();
            return 1;
        }

        let then = get_microseconds();
        let mut timeout_usecs: Usecs = if freewheeling {
            FREEWHEEL_POLL_TIMEOUT_USECS
        } else if !self.config.client_timeout.is_zero() {
            self.config.client_timeout.as_micros() as Usecs
        } else {
            period_usecs as Usecs
        };
        timeout_usecs = timeout_usecs.max(period_usecs as Usecs);

        loop {
            let timeout_ms = 1 + (timeout_usecs / 1_000) as i32;
            match wait.poll_readable(timeout_ms) {
                Ok(PollOutcome::Readable) => {
                    if let Err(e) = wait.try_read_byte() {
                        warn!("cannot clean up byte from graph wait fifo: {e}");
                        client.add_error(1);
                        return 1;
                    }
                    return 0;
                }
                Ok(PollOutcome::Lost) => {
                    warn!("subgraph starting at '{}' lost client", client.name);
                    client.add_error(1);
                    self.check_clients(graph, true);
                    return 1;
                }
                Ok(PollOutcome::TimedOut) => {
                    if freewheeling {
                        // not done yet, which is fine while freewheeling,
                        // unless somebody actually died
                        if self.check_clients(graph, false) {
                            return 1;
                        }
                        continue;
                    }
                    // spurious poll returns show up on some kernels;
                    // measure elapsed monotonic time and re-poll with the
                    // remainder instead of calling it a timeout
                    let elapsed = get_microseconds().saturating_sub(then);
                    if elapsed < timeout_usecs {
                        debug!(
                            "false wakeup ({elapsed} of {timeout_usecs} usecs elapsed)"
                        );
                        timeout_usecs -= elapsed;
                        continue;
                    }
                    warn!(
                        "subgraph starting at '{}' timed out (wait fifo {wait_idx}, state {})",
                        client.name,
                        control.state.load(Ordering::Relaxed)
                    );
                    self.check_clients(graph, true);
                    return 1;
                }
                Err(e) => {
                    warn!("poll on subgraph processing failed: {e}");
                    client.add_error(1);
                    return 1;
                }
            }
        }
    }

    /// Scans client run state; with `timeout_check`, a client that woke
    /// up but never finished is marked timed out. Returns whether any
    /// client is in error.
    pub(crate) fn check_clients(&self, graph: &Graph, timeout_check: bool) -> bool {
        let mut errs = 0;
        for client in graph.clients_in_order() {
            if client.error_count() > 0 {
                errs += 1;
                continue;
            }
            if timeout_check && client.is_active() && client.has_process_chain() {
                let control = client.control();
                // only a client that actually woke up can be blamed; the
                // kernel may simply never have scheduled it
                if control.awake_at.load(Ordering::Relaxed) > 0
                    && control.finished_at.load(Ordering::Relaxed) == 0
                {
                    control.timed_out.fetch_add(1, Ordering::Relaxed);
                    client.add_error(1);
                    warn!("client '{}' has timed out", client.name);
                    errs += 1;
                }
            }
        }
        if errs > 0 {
            self.signal_problems();
        }
        errs > 0
    }

    /// Transport advance, load accounting and the client status scan.
    fn post_process(&self, graph: &Graph, nframes: Frames, cycle_start: Usecs, period_usecs: f32) {
        {
            let mut transport = self.transport.lock().expect("transport lock poisoned");

            // collect slow-sync votes from external clients
            for client_id in transport.pending_sync_clients() {
                if let Ok(client) = graph.client(client_id) {
                    if client.handler.is_some() {
                        continue; // internal clients voted inline
                    }
                    let control = client.control();
                    if control.sync_ready.swap(0, Ordering::Relaxed) != 0 {
                        transport.sync_client_report(client_id, true);
                    }
                }
            }

            // merge a BBT update from an external timebase master
            if let Some(master) = transport.timebase_master()
                && graph
                    .client(master)
                    .is_ok_and(|c| c.ctype == ClientType::External)
            {
                let (_, pending) =
                    Position::snapshot(&self.control.header().transport_pending);
                if pending.unique != 0
                    && pending.unique != self.last_master_unique.swap(pending.unique, Ordering::Relaxed)
                {
                    transport.master_update(pending);
                }
            }

            transport.cycle_end(nframes, period_usecs, get_microseconds());
            transport.publish(&self.control.header().transport);

            // arm the sync poll flags for the next cycle
            let pending = transport.pending_sync_clients();
            for client in graph.clients_in_order() {
                let flag = pending.contains(&client.id) as u32;
                client.control().sync_poll.store(flag, Ordering::Relaxed);
            }
        }

        {
            let cycle_end = get_microseconds();
            let mut cpu = self.cpu.lock().expect("cpu load lock poisoned");
            if let Some((load, spare)) = cpu.update(cycle_end.saturating_sub(cycle_start), period_usecs)
            {
                self.control.header().set_cpu_load(load);
                self.spare_usecs.store(spare.to_bits(), Ordering::Relaxed);
                debug!("load = {load:.4} spare = {spare:.3}");
            }
        }

        // inspect what the clients reported this cycle
        for client in graph.clients_in_order() {
            if !client.is_active() || !client.has_process_chain() || client.is_internal() {
                continue;
            }
            let control = client.control();
            if control.last_status.load(Ordering::Relaxed) != 0 {
                warn!(
                    "client '{}' reported nonzero process status",
                    client.name
                );
                client.add_error(1);
            }
        }
        self.check_clients(graph, false);
    }

    // ------------------------------------------------------------------
    // driver buffer plumbing

    /// (port, arena buffer) pairs for the driver's capture (output)
    /// ports.
    pub(crate) fn driver_capture_buffers(
        &self,
        graph: &Graph,
        driver: &dyn Driver,
    ) -> Vec<(PortId, RawBuffer)> {
        self.driver_port_buffers(graph, driver, true)
    }

    /// (port, resolved buffer) pairs for the driver's playback (input)
    /// ports.
    pub(crate) fn driver_playback_buffers(
        &self,
        graph: &Graph,
        driver: &dyn Driver,
    ) -> Vec<(PortId, RawBuffer)> {
        self.driver_port_buffers(graph, driver, false)
    }

    fn driver_port_buffers(
        &self,
        graph: &Graph,
        driver: &dyn Driver,
        outputs: bool,
    ) -> Vec<(PortId, RawBuffer)> {
        let Some(client) = graph.client_by_name(driver.name()).or_else(|| {
            graph
                .clients_iter()
                .find(|c| c.ctype == ClientType::Driver)
        }) else {
            return Vec::new();
        };
        let segments = self.segments.read().expect("segment table lock poisoned");
        let mut mix = self.mix.lock().expect("mix buffer lock poisoned");
        let nframes = self.control.header().buffer_size_value();

        let mut buffers = Vec::new();
        for port in graph.ports.iter().filter(|p| p.client_id == client.id) {
            if port.is_output() != outputs {
                continue;
            }
            let Some(segment) = segments.get(port.ptype as usize) else {
                continue;
            };
            let buffer = if outputs {
                let offset = self.control.port(port.id).offset.load(Ordering::Relaxed);
                segment.buffer_at(offset)
            } else {
                let sources: Vec<RawBuffer> = graph
                    .input_sources(port)
                    .into_iter()
                    .map(|src| {
                        let offset = self.control.port(src).offset.load(Ordering::Relaxed);
                        segment.buffer_at(offset)
                    })
                    .collect();
                let zero = segment.buffer_at(segment.zero_offset());
                mix.resolve_input(
                    port.id,
                    &sources,
                    &self.port_types[port.ptype as usize],
                    zero,
                    nframes,
                )
            };
            buffers.push((port.id, buffer));
        }
        buffers
    }

    // ------------------------------------------------------------------
    // freewheel

    /// Decouples the cycle from the driver: the driver thread parks, a
    /// non-RT thread spins the cycle executor as fast as clients can
    /// process.
    pub fn start_freewheel(self: &Arc<Self>, client_id: ClientId) -> crate::error::EngineResult<()> {
        if self.freewheel.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting freewheeling (requested by client {client_id})");
        self.freewheel.client.store(client_id, Ordering::Relaxed);
        self.freewheel.stopping.store(false, Ordering::Relaxed);
        self.control
            .header()
            .freewheeling
            .store(1, Ordering::Relaxed);

        // park the driver thread before clients drop their RT scheduling
        {
            let (lock, _) = &self.driver_park;
            {
                *lock.lock().expect("driver park lock poisoned") = true;
            }
        }

        {
            let graph = self.graph.read().expect("graph lock poisoned");
            self.deliver_event_to_all(&graph, &Event::StartFreewheel);
        }

        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("jackd-rs-freewheel".to_owned())
            .spawn(move || {
                debug!("freewheel thread starting");
                let mut state = CycleState {
                    consecutive_excessive_delays: 0,
                };
                while !engine.freewheel.stopping.load(Ordering::Relaxed)
                    && !engine.shutting_down.load(Ordering::Relaxed)
                {
                    let nframes = engine.control.header().buffer_size_value();
                    engine.run_one_cycle(None, nframes, 0.0, &mut state);

                    let fw_client = engine.freewheel.client.load(Ordering::Relaxed);
                    let errored = {
                        let graph = engine.graph.read().expect("graph lock poisoned");
                        graph
                            .client(fw_client)
                            .map(|c| c.error_count() > 0 || c.control().is_dead())
                            .unwrap_or(true)
                    };
                    if errored {
                        // the server thread will clean up; time for us to
                        // depart this world
                        break;
                    }
                }
                debug!("freewheel came to an end, naturally");
            })?;
        {
            *self.freewheel.thread.lock().expect("freewheel thread lock poisoned") = Some(handle);
        }
        Ok(())
    }

    pub fn stop_freewheel(&self) -> crate::error::EngineResult<()> {
        if !self.freewheel.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping freewheeling");
        self.freewheel.stopping.store(true, Ordering::Relaxed);
        let handle = {
            self.freewheel.thread.lock().expect("freewheel thread lock poisoned").take()
        };
        if let Some(handle) = handle {
            handle.join().ok();
        }
        self.freewheel.active.store(false, Ordering::SeqCst);
        self.control
            .header()
            .freewheeling
            .store(0, Ordering::Relaxed);

        {
            let graph = self.graph.read().expect("graph lock poisoned");
            self.deliver_event_to_all(&graph, &Event::StopFreewheel);
        }

        // wake the driver thread back up
        let (lock, condvar) = &self.driver_park;
        {
            *lock.lock().expect("driver park lock poisoned") = false;
        }
        condvar.notify_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // watchdog

    /// Checks that the driver thread keeps making wakeups; a stalled RT
    /// thread takes the whole process group down for a dump.
    pub fn start_watchdog(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("jackd-rs-watchdog".to_owned())
            .spawn(move || {
                engine.watchdog_check.store(0, Ordering::Relaxed);
                loop {
                    std::thread::sleep(std::time::Duration::from_millis(WATCHDOG_TIMEOUT_MS));
                    if engine.shutting_down.load(Ordering::Relaxed) {
                        break;
                    }
                    if engine.freewheel.active.load(Ordering::Relaxed)
                        || !engine.driver_running.load(Ordering::Relaxed)
                    {
                        continue;
                    }
                    if engine.watchdog_check.swap(0, Ordering::Relaxed) == 0 {
                        error!("watchdog: timeout - killing jackd-rs");
                        unsafe {
                            libc::kill(-libc::getpgrp(), libc::SIGABRT);
                        }
                        std::process::exit(1);
                    }
                }
            })
    }
}

fn set_realtime_priority(priority: u8) {
    let tid = thread_native_id();
    let priority_value = ThreadPriorityValue::try_from(priority)
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max);
    if let Err(e) = set_thread_priority_and_policy(
        tid,
        priority_value,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {tid}.");
    }
}

/// Public entry for the freewheel thread and tests that drive cycles by
/// hand.
impl Engine {
    pub fn run_single_cycle(&self, drivers: &mut DriverSet, nframes: Frames) -> CycleOutcome {
        let mut state = CycleState {
            consecutive_excessive_delays: 0,
        };
        self.run_cycle(drivers, nframes, 0.0, &mut state)
    }
}
