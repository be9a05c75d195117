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

//! Latency propagation. Capture latency flows downstream (forward graph
//! order), playback latency flows upstream (reverse order). Clients with
//! a latency callback refine the propagation themselves; for everyone
//! else the engine applies the default: the union of what arrived on one
//! side is applied unchanged to the other.

use crate::{
    formats::{ClientId, MAX_LATENCY_HOPS, PortId},
    graph::Graph,
    protocol::{LatencyMode, LatencyRange, PortFlags},
    shm::{ControlShm, PortShared},
};
use std::sync::atomic::Ordering;

pub fn get_range(port: &PortShared, mode: LatencyMode) -> LatencyRange {
    match mode {
        LatencyMode::Capture => LatencyRange {
            min: port.capture_latency_min.load(Ordering::Relaxed),
            max: port.capture_latency_max.load(Ordering::Relaxed),
        },
        LatencyMode::Playback => LatencyRange {
            min: port.playback_latency_min.load(Ordering::Relaxed),
            max: port.playback_latency_max.load(Ordering::Relaxed),
        },
    }
}

pub fn set_range(port: &PortShared, mode: LatencyMode, range: LatencyRange) {
    match mode {
        LatencyMode::Capture => {
            port.capture_latency_min.store(range.min, Ordering::Relaxed);
            port.capture_latency_max.store(range.max, Ordering::Relaxed);
        }
        LatencyMode::Playback => {
            port.playback_latency_min.store(range.min, Ordering::Relaxed);
            port.playback_latency_max.store(range.max, Ordering::Relaxed);
        }
    }
}

fn union(a: Option<LatencyRange>, b: LatencyRange) -> LatencyRange {
    match a {
        None => b,
        Some(a) => LatencyRange {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        },
    }
}

/// Aggregates the connected counterpart ranges onto one side of a
/// client's ports: input ports take the union of their sources on the
/// capture pass, output ports the union of their destinations on the
/// playback pass. Unconnected ports fall back to {0,0}.
pub fn aggregate_client_edges(
    graph: &Graph,
    control: &ControlShm,
    client_id: ClientId,
    mode: LatencyMode,
) {
    for port in graph.ports.iter().filter(|p| p.client_id == client_id) {
        match mode {
            LatencyMode::Capture if port.is_input() => {
                let mut range = None;
                for conn_id in &port.incoming {
                    if let Some(conn) = graph.connection(*conn_id) {
                        range = Some(union(range, get_range(control.port(conn.src), mode)));
                    }
                }
                set_range(control.port(port.id), mode, range.unwrap_or_default());
            }
            LatencyMode::Playback if port.is_output() => {
                let mut range = None;
                for conn_id in &port.outgoing {
                    if let Some(conn) = graph.connection(*conn_id) {
                        range = Some(union(range, get_range(control.port(conn.dst), mode)));
                    }
                }
                set_range(control.port(port.id), mode, range.unwrap_or_default());
            }
            _ => {}
        }
    }
}

/// The propagation a client without a latency callback gets: the union
/// over the arriving side is applied to every port on the departing
/// side.
pub fn default_client_propagation(
    graph: &Graph,
    control: &ControlShm,
    client_id: ClientId,
    mode: LatencyMode,
) {
    let (from_input, to_input) = match mode {
        LatencyMode::Capture => (true, false),
        LatencyMode::Playback => (false, true),
    };

    let mut range = None;
    for port in graph.ports.iter().filter(|p| p.client_id == client_id) {
        if port.is_input() == from_input {
            range = Some(union(range, get_range(control.port(port.id), mode)));
        }
    }
    let range = range.unwrap_or_default();
    for port in graph.ports.iter().filter(|p| p.client_id == client_id) {
        if port.is_input() == to_input {
            set_range(control.port(port.id), mode, range);
        }
    }
}

fn scalar_latency(port: &PortShared) -> u32 {
    port.capture_latency_max
        .load(Ordering::Relaxed)
        .max(port.playback_latency_max.load(Ordering::Relaxed))
}

fn walk_total_latency(
    graph: &Graph,
    control: &ControlShm,
    port_id: PortId,
    hop_count: u32,
    toward_port: bool,
) -> u32 {
    let shared = control.port(port_id);
    let latency = scalar_latency(shared);

    // cycles are not prevented structurally, so the walk must bottom out
    if hop_count > MAX_LATENCY_HOPS {
        return latency;
    }

    let Ok(port) = graph.ports.get(port_id) else {
        return latency;
    };

    let mut max_latency = 0;
    for conn_id in port.incoming.iter().chain(port.outgoing.iter()) {
        let Some(conn) = graph.connection(*conn_id) else {
            continue;
        };
        // skip the direction we are not walking
        if (toward_port && conn.src == port_id) || (!toward_port && conn.dst == port_id) {
            continue;
        }
        let other_id = if conn.dst == port_id { conn.src } else { conn.dst };
        let other_shared = control.port(other_id);
        let this_latency = if PortFlags::from_bits_truncate(
            other_shared.flags.load(Ordering::Relaxed),
        )
        .contains(PortFlags::IS_TERMINAL)
        {
            scalar_latency(other_shared)
        } else {
            walk_total_latency(graph, control, other_id, hop_count + 1, toward_port)
        };
        max_latency = max_latency.max(this_latency);
    }

    latency + max_latency
}

pub fn compute_port_total_latency(graph: &Graph, control: &ControlShm, port_id: PortId) {
    let shared = control.port(port_id);
    if shared.in_use.load(Ordering::Relaxed) == 0 {
        return;
    }
    let toward_port = !PortFlags::from_bits_truncate(shared.flags.load(Ordering::Relaxed))
        .contains(PortFlags::IS_OUTPUT);
    let total = walk_total_latency(graph, control, port_id, 0, toward_port);
    shared.total_latency.store(total, Ordering::Relaxed);
}

pub fn compute_all_port_total_latencies(graph: &Graph, control: &ControlShm) {
    for port in graph.ports.iter() {
        compute_port_total_latency(graph, control, port.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        client::ClientType,
        formats::Uuid,
        port::builtin_port_types,
        shm::ControlShm,
    };

    struct Fixture {
        control: ControlShm,
        graph: Graph,
    }

    fn fixture() -> Fixture {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = format!("jackd-rs-latency-test-{}-{n}", std::process::id());
        let control = ControlShm::create(&id, 32).expect("create failed");
        Fixture {
            control,
            graph: Graph::new(32, 2),
        }
    }

    fn add_client(f: &mut Fixture, id: ClientId, name: &str, ctype: ClientType) {
        use crate::{
            client::{ClientControlHandle, ClientInternal, Lifecycle},
            shm::ClientControlShared,
        };
        let control = ClientControlShared::default();
        control.active.store(1, Ordering::Relaxed);
        f.graph.add_client(ClientInternal {
            id,
            uuid: Uuid(id as u128 + 1),
            name: name.to_owned(),
            ctype,
            control: ClientControlHandle::Heap(Box::new(control)),
            shm_id: None,
            lifecycle: Lifecycle::Active,
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
        });
    }

    fn add_port(f: &mut Fixture, client: ClientId, name: &str, flags: PortFlags) -> PortId {
        let types = builtin_port_types();
        let client_name = f.graph.client(client).expect("client").name.clone();
        f.graph
            .ports
            .register(
                &f.control,
                client,
                Uuid(client as u128 + 1),
                &client_name,
                name,
                0,
                &types[0],
                flags,
                false,
            )
            .expect("register failed")
    }

    #[test]
    fn capture_latency_propagates_downstream() {
        let mut f = fixture();
        let types = builtin_port_types();
        add_client(&mut f, 0, "system", ClientType::Driver);
        add_client(&mut f, 1, "pass", ClientType::External);
        let capture = add_port(
            &mut f,
            0,
            "capture_1",
            PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
        );
        let pass_in = add_port(&mut f, 1, "in", PortFlags::IS_INPUT);
        let pass_out = add_port(&mut f, 1, "out", PortFlags::IS_OUTPUT);

        set_range(
            f.control.port(capture),
            LatencyMode::Capture,
            LatencyRange { min: 64, max: 64 },
        );
        f.graph
            .connect(&types, "system:capture_1", "pass:in")
            .expect("connect failed");

        aggregate_client_edges(&f.graph, &f.control, 1, LatencyMode::Capture);
        default_client_propagation(&f.graph, &f.control, 1, LatencyMode::Capture);

        assert_eq!(
            get_range(f.control.port(pass_in), LatencyMode::Capture),
            LatencyRange { min: 64, max: 64 }
        );
        assert_eq!(
            get_range(f.control.port(pass_out), LatencyMode::Capture),
            LatencyRange { min: 64, max: 64 }
        );
    }

    #[test]
    fn unconnected_ports_get_zero_ranges() {
        let mut f = fixture();
        add_client(&mut f, 1, "solo", ClientType::External);
        let input = add_port(&mut f, 1, "in", PortFlags::IS_INPUT);
        set_range(
            f.control.port(input),
            LatencyMode::Capture,
            LatencyRange { min: 5, max: 9 },
        );
        aggregate_client_edges(&f.graph, &f.control, 1, LatencyMode::Capture);
        assert_eq!(
            get_range(f.control.port(input), LatencyMode::Capture),
            LatencyRange::default()
        );
    }

    #[test]
    fn total_latency_sums_across_the_chain() {
        let mut f = fixture();
        let types = builtin_port_types();
        add_client(&mut f, 0, "system", ClientType::Driver);
        add_client(&mut f, 1, "pass", ClientType::External);
        let capture = add_port(
            &mut f,
            0,
            "capture_1",
            PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
        );
        let pass_in = add_port(&mut f, 1, "in", PortFlags::IS_INPUT);

        set_range(
            f.control.port(capture),
            LatencyMode::Capture,
            LatencyRange { min: 64, max: 64 },
        );
        set_range(
            f.control.port(pass_in),
            LatencyMode::Capture,
            LatencyRange { min: 10, max: 10 },
        );
        f.graph
            .connect(&types, "system:capture_1", "pass:in")
            .expect("connect failed");

        compute_all_port_total_latencies(&f.graph, &f.control);
        assert_eq!(
            f.control.port(pass_in).total_latency.load(Ordering::Relaxed),
            74
        );
    }

    #[test]
    fn feedback_walks_bottom_out() {
        let mut f = fixture();
        let types = builtin_port_types();
        add_client(&mut f, 1, "a", ClientType::External);
        add_client(&mut f, 2, "b", ClientType::External);
        for (client, name) in [(1, "a"), (2, "b")] {
            let _ = name;
            add_port(&mut f, client, "in", PortFlags::IS_INPUT);
            add_port(&mut f, client, "out", PortFlags::IS_OUTPUT);
        }
        f.graph.connect(&types, "a:out", "b:in").expect("a->b");
        f.graph.connect(&types, "b:out", "a:in").expect("b->a");

        // must terminate despite the cycle
        compute_all_port_total_latencies(&f.graph, &f.control);
    }
}
