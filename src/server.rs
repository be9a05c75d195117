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

//! The non-RT server thread: client admission on the request socket,
//! event socket pairing, request dispatch under the request lock and the
//! problem cleanup that zombifies or removes failing clients outside the
//! cycle.

use crate::{
    engine::{Engine, EngineSignal},
    error::{EngineError, EngineResult},
    formats::{ClientId, PROTOCOL_VERSION},
    latency,
    protocol::{
        self, ClientOpen, ClientOpenReply, ClientStatus, Event, EventHello, Request, Response,
        callback_bits,
    },
};
use std::sync::{Arc, Mutex as StdMutex, atomic::Ordering};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::{Mutex, mpsc},
    task::spawn_blocking,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

pub struct ServerHandle {
    pub engine: Arc<Engine>,
}

/// Starts the server subsystems: request acceptor, event acceptor and
/// the signal handler.
pub async fn start_server(
    subsys: &SubsystemHandle,
    engine: Arc<Engine>,
    signal_rx: mpsc::UnboundedReceiver<EngineSignal>,
) -> EngineResult<ServerHandle> {
    let request_path = engine.context.request_socket_path();
    let event_path = engine.context.event_socket_path();
    let _ = std::fs::remove_file(&request_path);
    let _ = std::fs::remove_file(&event_path);

    let request_listener = UnixListener::bind(&request_path)?;
    let event_listener = UnixListener::bind(&event_path)?;
    info!(
        "Listening on {} (requests) and {} (events)",
        request_path.to_string_lossy(),
        event_path.to_string_lossy()
    );

    let request_lock = Arc::new(Mutex::new(()));

    {
        let engine = Arc::clone(&engine);
        let request_lock = Arc::clone(&request_lock);
        subsys.start(SubsystemBuilder::new("request-acceptor", move |s| {
            accept_requests(s, engine, request_listener, request_lock)
        }));
    }
    {
        let engine = Arc::clone(&engine);
        subsys.start(SubsystemBuilder::new("event-acceptor", move |s| {
            accept_events(s, engine, event_listener)
        }));
    }
    {
        let engine = Arc::clone(&engine);
        subsys.start(SubsystemBuilder::new("signals", move |s| {
            handle_signals(s, engine, signal_rx)
        }));
    }

    Ok(ServerHandle { engine })
}

async fn accept_requests(
    subsys: SubsystemHandle,
    engine: Arc<Engine>,
    listener: UnixListener,
    request_lock: Arc<Mutex<()>>,
) -> EngineResult<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let engine = Arc::clone(&engine);
                let request_lock = Arc::clone(&request_lock);
                subsys.start(SubsystemBuilder::new("client", move |s| {
                    client_connection(s, engine, stream, request_lock)
                }));
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    Ok(())
}

async fn accept_events(
    subsys: SubsystemHandle,
    engine: Arc<Engine>,
    listener: UnixListener,
) -> EngineResult<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, _) = accepted?;
                let hello: EventHello = match protocol::read_frame(&mut stream).await {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!("bad event socket handshake: {e}");
                        continue;
                    }
                };
                attach_event_stream(&engine, hello.client_id, stream);
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    Ok(())
}

fn attach_event_stream(engine: &Engine, client_id: ClientId, stream: UnixStream) {
    let std_stream = match stream.into_std() {
        Ok(s) => s,
        Err(e) => {
            warn!("could not convert event stream: {e}");
            return;
        }
    };
    if let Err(e) = std_stream.set_nonblocking(false) {
        warn!("could not configure event stream: {e}");
        return;
    }
    let mut graph = engine.graph.write().expect("graph lock poisoned");
    match graph.client_mut(client_id) {
        Ok(client) => {
            debug!("event channel attached for client '{}'", client.name);
            client.event_stream = Some(StdMutex::new(std_stream));
        }
        Err(e) => warn!("event socket for unknown client {client_id}: {e}"),
    }
}

#[instrument(skip(subsys, engine, stream, request_lock))]
async fn client_connection(
    subsys: SubsystemHandle,
    engine: Arc<Engine>,
    mut stream: UnixStream,
    request_lock: Arc<Mutex<()>>,
) -> EngineResult<()> {
    let open: ClientOpen = match protocol::read_frame(&mut stream).await {
        Ok(open) => open,
        Err(e) => {
            warn!("bad client handshake: {e}");
            return Ok(());
        }
    };

    if open.protocol_version != PROTOCOL_VERSION {
        warn!(
            "client '{}' speaks protocol {}, engine speaks {}",
            open.name, open.protocol_version, PROTOCOL_VERSION
        );
        let reply = failed_open(ClientStatus::FAILURE | ClientStatus::VERSION_ERROR);
        protocol::write_frame(&mut stream, &reply).await?;
        return Ok(());
    }

    let reply = match engine.create_external_client(&open.name, open.options, open.uuid, open.pid)
    {
        Ok(reply) => reply,
        Err(status) => {
            protocol::write_frame(&mut stream, &failed_open(status)).await?;
            return Ok(());
        }
    };
    let client_id = reply.client_id;
    protocol::write_frame(&mut stream, &reply).await?;

    loop {
        let request: Request = tokio::select! {
            request = protocol::read_frame(&mut stream) => match request {
                Ok(request) => request,
                Err(e) => {
                    debug!("client {client_id} request socket closed: {e}");
                    break;
                }
            },
            _ = subsys.on_shutdown_requested() => return Ok(()),
        };

        let closing = matches!(request, Request::CloseClient { .. });
        let response = {
            let _guard = request_lock.lock().await;
            let engine = Arc::clone(&engine);
            spawn_blocking(move || dispatch_request(&engine, request))
                .await
                .unwrap_or_else(|e| Response::Error {
                    code: 0,
                    message: format!("request execution failed: {e}"),
                })
        };
        if protocol::write_frame(&mut stream, &response).await.is_err() {
            break;
        }
        if closing {
            return Ok(());
        }
    }

    // socket loss without CloseClient: the client is gone, clean up
    let engine = Arc::clone(&engine);
    spawn_blocking(move || {
        let mut graph = engine.graph.write().expect("graph lock poisoned");
        if graph.client(client_id).is_ok()
            && let Err(e) = engine.remove_client(&mut graph, client_id)
        {
            warn!("cleanup of departed client {client_id} failed: {e}");
        }
    })
    .await
    .ok();
    Ok(())
}

fn failed_open(status: ClientStatus) -> ClientOpenReply {
    ClientOpenReply {
        status,
        client_id: 0,
        uuid: crate::formats::Uuid(0),
        name: String::new(),
        engine_pid: std::process::id(),
        port_max: 0,
        control_shm_id: String::new(),
        client_shm_id: String::new(),
        fifo_prefix: String::new(),
        client_rt_priority: 0,
        realtime: false,
    }
}

async fn handle_signals(
    subsys: SubsystemHandle,
    engine: Arc<Engine>,
    mut signal_rx: mpsc::UnboundedReceiver<EngineSignal>,
) -> EngineResult<()> {
    loop {
        tokio::select! {
            signal = signal_rx.recv() => match signal {
                Some(EngineSignal::Problems) => {
                    let engine = Arc::clone(&engine);
                    spawn_blocking(move || {
                        engine.handle_problem_clients();
                        if engine.freewheel.stopping.load(Ordering::Relaxed) {
                            engine.stop_freewheel().ok();
                        }
                    })
                    .await
                    .ok();
                }
                Some(EngineSignal::DriverExit) => {
                    warn!("driver exited, shutting down");
                    engine.shutdown(ClientStatus::SERVER_ERROR, "backend driver exited");
                    subsys.request_shutdown();
                    break;
                }
                Some(EngineSignal::Temporary) => {
                    info!("temporary server shutting down");
                    engine.shutdown(ClientStatus::SERVER_ERROR, "temporary server done");
                    subsys.request_shutdown();
                    break;
                }
                None => break,
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    Ok(())
}

fn errno_for(e: &EngineError) -> i32 {
    match e {
        EngineError::AlreadyConnected(_, _) => libc::EEXIST,
        EngineError::BufferSizeNotPowerOfTwo(_) => libc::EINVAL,
        EngineError::BufferSizeOutOfRange(_) => libc::ERANGE,
        _ => 0,
    }
}

fn result_response(result: EngineResult<Response>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => Response::Error {
            code: errno_for(&e),
            message: e.to_string(),
        },
    }
}

/// Executes one request. Runs under the request lock; operations that
/// mutate the graph take the graph write lock themselves.
pub fn dispatch_request(engine: &Arc<Engine>, request: Request) -> Response {
    result_response(try_dispatch(engine, request))
}

#[allow(clippy::too_many_lines)]
fn try_dispatch(engine: &Arc<Engine>, request: Request) -> EngineResult<Response> {
    if engine.shutting_down.load(Ordering::Relaxed) {
        return Err(EngineError::ShuttingDown);
    }
    match request {
        Request::RegisterPort {
            client_id,
            short_name,
            type_name,
            flags,
            buffer_size_hint,
        } => {
            let port_id = engine.register_port(
                client_id,
                &short_name,
                &type_name,
                flags,
                buffer_size_hint,
            )?;
            Ok(Response::PortId(port_id))
        }
        Request::UnregisterPort { client_id, port_id } => {
            engine.unregister_port(client_id, port_id)?;
            Ok(Response::Ok)
        }
        Request::ConnectPorts {
            source,
            destination,
        } => {
            engine.connect_ports(&source, &destination)?;
            Ok(Response::Ok)
        }
        Request::DisconnectPorts {
            source,
            destination,
        } => {
            engine.disconnect_ports(&source, &destination)?;
            Ok(Response::Ok)
        }
        Request::DisconnectPort { port_id } => {
            engine.disconnect_port_all(port_id)?;
            Ok(Response::Ok)
        }
        Request::RenamePort {
            client_id,
            port_id,
            short_name,
        } => {
            engine.rename_port(client_id, port_id, &short_name)?;
            Ok(Response::Ok)
        }
        Request::SetPortAlias { port_id, alias } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            graph.ports.set_alias(&engine.control, port_id, &alias)?;
            Ok(Response::Ok)
        }
        Request::ActivateClient { client_id } => {
            engine.activate_client(client_id)?;
            Ok(Response::Ok)
        }
        Request::DeactivateClient { client_id } => {
            engine.deactivate_client(client_id)?;
            Ok(Response::Ok)
        }
        Request::SetTimebaseClient {
            client_id,
            conditional,
        } => {
            engine
                .transport
                .lock()
                .expect("transport lock poisoned")
                .set_timebase_master(client_id, conditional)?;
            Ok(Response::Ok)
        }
        Request::ResetTimebaseClient { client_id } => {
            engine
                .transport
                .lock()
                .expect("transport lock poisoned")
                .reset_timebase_master(client_id)?;
            Ok(Response::Ok)
        }
        Request::SetSyncClient { client_id } => {
            engine.transport.lock().expect("transport lock poisoned").set_sync_client(client_id);
            Ok(Response::Ok)
        }
        Request::ResetSyncClient { client_id } => {
            engine
                .transport
                .lock()
                .expect("transport lock poisoned")
                .remove_sync_client(client_id);
            Ok(Response::Ok)
        }
        Request::SetSyncTimeout { usecs } => {
            engine.transport.lock().expect("transport lock poisoned").set_sync_timeout(usecs);
            Ok(Response::Ok)
        }
        Request::SetBufferSize { nframes } => {
            engine.set_buffer_size(nframes)?;
            Ok(Response::Ok)
        }
        Request::TransportStart => {
            engine.transport_start();
            Ok(Response::Ok)
        }
        Request::TransportStop => {
            engine.transport_stop();
            Ok(Response::Ok)
        }
        Request::TransportLocate { frame } => {
            engine.transport_locate(frame);
            Ok(Response::Ok)
        }
        Request::TransportReposition { position } => {
            engine.transport.lock().expect("transport lock poisoned").reposition(position);
            Ok(Response::Ok)
        }
        Request::Freewheel { client_id } => {
            engine.start_freewheel(client_id)?;
            Ok(Response::Ok)
        }
        Request::StopFreewheel { client_id: _ } => {
            engine.stop_freewheel()?;
            Ok(Response::Ok)
        }
        Request::IntClientHandle { name } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            match graph.client_by_name(&name) {
                Some(client) if client.is_internal() => Ok(Response::IntClient {
                    int_client_id: client.id,
                    status: ClientStatus::empty(),
                }),
                _ => Ok(Response::IntClient {
                    int_client_id: 0,
                    status: ClientStatus::FAILURE | ClientStatus::NO_SUCH_CLIENT,
                }),
            }
        }
        Request::IntClientLoad { name, path, init } => {
            // in-process clients are compiled in, not dlopened
            warn!("refusing to load internal client '{name}' from '{path}' ({init})");
            Ok(Response::IntClient {
                int_client_id: 0,
                status: ClientStatus::FAILURE | ClientStatus::LOAD_FAILURE,
            })
        }
        Request::IntClientName { int_client_id } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            let client = graph.client(int_client_id)?;
            Ok(Response::ClientName(client.name.clone()))
        }
        Request::IntClientUnload { int_client_id } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            engine.remove_client(&mut graph, int_client_id)?;
            Ok(Response::Ok)
        }
        Request::RecomputeTotalLatencies => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            engine.compute_new_latency(&mut graph);
            Ok(Response::Ok)
        }
        Request::RecomputeTotalLatency { port_id } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            latency::compute_port_total_latency(&graph, &engine.control, port_id);
            Ok(Response::Ok)
        }
        Request::SessionNotify { target, save_path } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            let event = Event::SaveSession { path: save_path };
            let targets: Vec<ClientId> = graph
                .clients_in_order()
                .filter(|c| target.as_deref().is_none_or(|t| t == c.name))
                .filter(|c| c.control().has_callback(callback_bits::SESSION))
                .map(|c| c.id)
                .collect();
            for client_id in targets {
                if let Ok(client) = graph.client_mut(client_id) {
                    client.session_reply_pending = true;
                }
                engine.deliver_event_checked(&graph, client_id, &event);
            }
            Ok(Response::Ok)
        }
        Request::SessionReply { client_id } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            graph.client_mut(client_id)?.session_reply_pending = false;
            Ok(Response::Ok)
        }
        Request::SessionHasCallback { client_id } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            let has = graph
                .client(client_id)?
                .control()
                .has_callback(callback_bits::SESSION);
            Ok(Response::HasCallback(has))
        }
        Request::GetPortConnections { port_id } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            Ok(Response::Connections(graph.connections_of(port_id)?))
        }
        Request::GetPortNConnections { port_id } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            Ok(Response::NConnections(
                graph.connections_of(port_id)?.len() as u32
            ))
        }
        Request::GetClientByUuid { uuid } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            graph
                .clients_iter()
                .find(|c| c.uuid == uuid)
                .map(|c| Response::ClientName(c.name.clone()))
                .ok_or_else(|| EngineError::UnknownClient(uuid.to_string()))
        }
        Request::GetUuidByClientName { name } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            graph
                .client_by_name(&name)
                .map(|c| Response::ClientUuid(c.uuid))
                .ok_or(EngineError::UnknownClient(name))
        }
        Request::ReserveName { name, uuid } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            graph.reserve_name(uuid, name)?;
            Ok(Response::Ok)
        }
        Request::PropertyChangeNotify {
            subject,
            key,
            change,
        } => {
            let graph = engine.graph.read().expect("graph lock poisoned");
            engine.deliver_event_to_all(
                &graph,
                &Event::PropertyChange {
                    subject,
                    key,
                    change,
                },
            );
            Ok(Response::Ok)
        }
        Request::SetClientCapabilities { client_id: _ } => Ok(Response::Ok),
        Request::SetProperty {
            subject,
            key,
            value,
            value_type,
        } => {
            let change =
                engine
                    .metadata
                    .set_property(subject, &key, &value, value_type.as_deref());
            let graph = engine.graph.read().expect("graph lock poisoned");
            engine.deliver_event_to_all(
                &graph,
                &Event::PropertyChange {
                    subject,
                    key: Some(key),
                    change,
                },
            );
            Ok(Response::Ok)
        }
        Request::GetProperty { subject, key } => Ok(Response::Property(
            engine
                .metadata
                .get_property(subject, &key)
                .map(|(value, value_type)| crate::metadata::Property {
                    subject,
                    key,
                    value,
                    value_type,
                }),
        )),
        Request::GetProperties { subject } => Ok(Response::Properties(
            engine.metadata.get_properties(subject),
        )),
        Request::GetAllProperties => Ok(Response::Properties(
            engine.metadata.get_all_properties(),
        )),
        Request::RemoveProperty { subject, key } => {
            let removed = engine.metadata.remove_property(subject, &key);
            if removed {
                let graph = engine.graph.read().expect("graph lock poisoned");
                engine.deliver_event_to_all(
                    &graph,
                    &Event::PropertyChange {
                        subject,
                        key: Some(key),
                        change: crate::metadata::PropertyChangeKind::Deleted,
                    },
                );
            }
            Ok(Response::Ok)
        }
        Request::RemoveProperties { subject } => {
            let count = engine.metadata.remove_properties(subject);
            if count > 0 {
                let graph = engine.graph.read().expect("graph lock poisoned");
                engine.deliver_event_to_all(
                    &graph,
                    &Event::PropertyChange {
                        subject,
                        key: None,
                        change: crate::metadata::PropertyChangeKind::Deleted,
                    },
                );
            }
            Ok(Response::RemovedCount(count))
        }
        Request::RemoveAllProperties => {
            engine.metadata.remove_all_properties();
            let graph = engine.graph.read().expect("graph lock poisoned");
            engine.deliver_event_to_all(
                &graph,
                &Event::PropertyChange {
                    subject: crate::formats::Uuid(0),
                    key: None,
                    change: crate::metadata::PropertyChangeKind::Deleted,
                },
            );
            Ok(Response::Ok)
        }
        Request::CloseClient { client_id } => {
            let mut graph = engine.graph.write().expect("graph lock poisoned");
            engine.remove_client(&mut graph, client_id)?;
            Ok(Response::Ok)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::{Client, ClosureProcessHandler, Control, SilentNotifications},
        config::{Config, DriverConfig},
        driver::ManualDriver,
        engine::cycle::DriverSet,
        formats::AUDIO_TYPE_NAME,
        protocol::{ClientOptions, PortFlags},
    };
    use std::{
        sync::atomic::AtomicU32,
        time::{Duration, Instant},
    };

    /// Full control-plane and data-plane round trip with a real external
    /// client: open over the sockets, register ports, activate, get
    /// scheduled through the FIFO chain and see connections through the
    /// shared registry.
    #[test]
    fn external_client_round_trip_works() {
        let mut config = Config::default();
        config.engine.server_name = format!("srv-e2e-{}", std::process::id());
        config.engine.realtime = false;
        config.engine.watchdog = false;
        config.engine.port_max = 32;
        config.engine.client_timeout = Duration::from_millis(500);
        config.driver = DriverConfig {
            sample_rate: 48_000,
            buffer_size: 128,
            capture_channels: 2,
            playback_channels: 2,
        };

        let (engine, signal_rx) = Engine::new(&config).expect("engine failed");
        let (mut driver, ticks) = ManualDriver::new(48_000, 128, 2, 2);
        engine.attach_driver(&mut driver).expect("attach failed");

        let server_engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime failed");
            runtime.block_on(async move {
                tokio_graceful_shutdown::Toplevel::new(move |s| async move {
                    start_server(&s, server_engine, signal_rx)
                        .await
                        .expect("server failed");
                })
                .handle_shutdown_requests(Duration::from_secs(1))
                .await
                .ok();
            });
        });
        engine
            .start_driver_thread(DriverSet::new(Box::new(driver)))
            .expect("driver thread failed");

        let socket = engine.context.request_socket_path();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        let server_name = engine.context.server_name().to_owned();
        let (client, status) =
            Client::open("pass", ClientOptions::empty(), Some(&server_name)).expect("open failed");
        assert!(!status.contains(crate::protocol::ClientStatus::FAILURE));
        assert_eq!(client.sample_rate(), 48_000);
        assert_eq!(client.buffer_size(), 128);

        client
            .register_port("in", AUDIO_TYPE_NAME, PortFlags::IS_INPUT)
            .expect("input failed");
        client
            .register_port("out", AUDIO_TYPE_NAME, PortFlags::IS_OUTPUT)
            .expect("output failed");

        let cycles = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&cycles);
        let active = client
            .activate(
                SilentNotifications,
                ClosureProcessHandler::new(move |_scope| {
                    seen.fetch_add(1, Ordering::Relaxed);
                    Control::Continue
                }),
            )
            .expect("activate failed");

        active
            .connect_ports_by_name("system:capture_1", "pass:in")
            .expect("connect failed");

        let deadline = Instant::now() + Duration::from_secs(10);
        while cycles.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            ticks.tick();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(
            cycles.load(Ordering::Relaxed) > 0,
            "external client was never scheduled"
        );

        // the shared registry is visible client side
        assert!(active.port_by_name("system:capture_1").is_some());
        let connections = active
            .port_by_name("pass:in")
            .expect("own port missing")
            .get_connections()
            .expect("connections failed");
        assert_eq!(connections, vec!["system:capture_1".to_owned()]);
    }
}
