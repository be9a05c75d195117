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

//! The engine's structural state: clients, ports, connections and the
//! sorted execution order.
//!
//! How the sort works: each client has a `sortfeeds` list naming the
//! clients it must run before. It differs from the clients it actually
//! feeds (`truefeeds`) in three ways: self connections are disregarded,
//! connections into a driver are disregarded, and a connection that
//! closes a cycle (a feedback connection) appears reversed, so the
//! sortfeeds relation stays acyclic and every ordering constraint can be
//! met. `truefeeds` keeps feedback edges in natural direction and drives
//! the check that notices when the graph has become acyclic again.

use crate::{
    client::{ClientInternal, ClientType},
    error::{EngineError, EngineResult},
    formats::{ClientId, ConnectionId, PortId, Uuid},
    port::{PortRegistry, PortTypeInfo},
    protocol::Event,
    shm::ControlShm,
    fifo::FifoRing,
};
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::atomic::Ordering as AtomicOrdering,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Both ports belong to the same client; no ordering effect.
    SelfConn,
    Forward,
    Feedback,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub src: PortId,
    pub dst: PortId,
    pub src_client: ClientId,
    pub dst_client: ClientId,
    pub dir: Orientation,
    /// Whether this connection contributed to truefeeds/fedcount.
    /// Connections into a driver (and self connections) do not.
    pub counts_feeds: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionEffect {
    pub src: PortId,
    pub dst: PortId,
    pub src_client: ClientId,
    pub dst_client: ClientId,
}

pub struct Graph {
    /// Client ids in scheduled order.
    pub order: Vec<ClientId>,
    clients: HashMap<ClientId, ClientInternal>,
    pub ports: PortRegistry,
    connections: Vec<Option<ConnectionRecord>>,
    free_connections: Vec<ConnectionId>,
    pub feedback_count: u32,
    /// Names promised to specific UUIDs via ReserveName.
    pub reserved_names: Vec<(Uuid, String)>,
}

impl Graph {
    pub fn new(port_max: u32, n_types: usize) -> Self {
        Self {
            order: Vec::new(),
            clients: HashMap::new(),
            ports: PortRegistry::new(port_max, n_types),
            connections: Vec::new(),
            free_connections: Vec::new(),
            feedback_count: 0,
            reserved_names: Vec::new(),
        }
    }

    pub fn client(&self, id: ClientId) -> EngineResult<&ClientInternal> {
        self.clients
            .get(&id)
            .ok_or_else(|| EngineError::UnknownClient(id.to_string()))
    }

    pub fn client_mut(&mut self, id: ClientId) -> EngineResult<&mut ClientInternal> {
        self.clients
            .get_mut(&id)
            .ok_or_else(|| EngineError::UnknownClient(id.to_string()))
    }

    pub fn client_by_name(&self, name: &str) -> Option<&ClientInternal> {
        self.clients.values().find(|c| c.name == name)
    }

    pub fn clients_in_order(&self) -> impl Iterator<Item = &ClientInternal> {
        self.order.iter().filter_map(|id| self.clients.get(id))
    }

    pub fn clients_iter(&self) -> impl Iterator<Item = &ClientInternal> {
        self.clients.values()
    }

    pub fn add_client(&mut self, client: ClientInternal) {
        self.order.push(client.id);
        self.clients.insert(client.id, client);
    }

    pub fn take_client(&mut self, id: ClientId) -> Option<ClientInternal> {
        self.order.retain(|c| *c != id);
        self.clients.remove(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn external_client_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.ctype == ClientType::External)
            .count()
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.clients.values().any(|c| c.name == name)
            || self.reserved_names.iter().any(|(_, n)| n == name)
    }

    pub fn reserve_name(&mut self, uuid: Uuid, name: String) -> EngineResult<()> {
        if self.name_taken(&name) {
            return Err(EngineError::NameNotUnique(name));
        }
        self.reserved_names.push((uuid, name));
        Ok(())
    }

    pub fn take_reserved_name(&mut self, uuid: Uuid) -> Option<String> {
        let index = self.reserved_names.iter().position(|(u, _)| *u == uuid)?;
        Some(self.reserved_names.swap_remove(index).1)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(id as usize).and_then(Option::as_ref)
    }

    /// Source ports feeding `port`, in connection order.
    pub fn input_sources(&self, port: &crate::port::PortInternal) -> Vec<PortId> {
        port.incoming
            .iter()
            .filter_map(|c| self.connection(*c))
            .map(|c| c.src)
            .collect()
    }

    /// Names of all ports connected to `port_id`.
    pub fn connections_of(&self, port_id: PortId) -> EngineResult<Vec<String>> {
        let port = self.ports.get(port_id)?;
        let mut names = Vec::new();
        for conn_id in port.incoming.iter().chain(port.outgoing.iter()) {
            if let Some(conn) = self.connection(*conn_id) {
                let other = if conn.dst == port_id { conn.src } else { conn.dst };
                names.push(self.ports.get(other)?.name.clone());
            }
        }
        Ok(names)
    }

    fn insert_connection(&mut self, mut record: ConnectionRecord) -> ConnectionId {
        if let Some(id) = self.free_connections.pop() {
            record.id = id;
            self.connections[id as usize] = Some(record);
            id
        } else {
            let id = self.connections.len() as ConnectionId;
            record.id = id;
            self.connections.push(Some(record));
            id
        }
    }

    /// Transitive closure of the sortfeeds relation.
    pub fn client_feeds_transitive(&self, source: ClientId, dest: ClientId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![source];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(client) = self.clients.get(&current) else {
                continue;
            };
            for fed in &client.sortfeeds {
                if *fed == dest {
                    return true;
                }
                stack.push(*fed);
            }
        }
        false
    }

    /// Validates and records one connection, classifying its orientation.
    /// The caller must hold the graph write lock and run the sort
    /// afterwards.
    pub fn connect(
        &mut self,
        types: &[PortTypeInfo],
        source_name: &str,
        destination_name: &str,
    ) -> EngineResult<ConnectionEffect> {
        let src_id = self.ports.find_by_name(source_name)?;
        let dst_id = self.ports.find_by_name(destination_name)?;
        if src_id == dst_id {
            return Err(EngineError::IncompatiblePorts(
                source_name.to_owned(),
                destination_name.to_owned(),
            ));
        }

        let (src_client_id, dst_client_id) = {
            let src = self.ports.get(src_id)?;
            let dst = self.ports.get(dst_id)?;
            if !dst.is_input() || !src.is_output() || src.ptype != dst.ptype {
                return Err(EngineError::IncompatiblePorts(
                    src.name.clone(),
                    dst.name.clone(),
                ));
            }
            for conn_id in &src.outgoing {
                if self.connection(*conn_id).is_some_and(|c| c.dst == dst_id) {
                    return Err(EngineError::AlreadyConnected(
                        src.name.clone(),
                        dst.name.clone(),
                    ));
                }
            }
            if !dst.incoming.is_empty() && !types[dst.ptype as usize].has_mixdown() {
                return Err(EngineError::NoMixdown(
                    types[dst.ptype as usize].name.to_owned(),
                ));
            }
            (src.client_id, dst.client_id)
        };

        for (client_id, name) in [(src_client_id, source_name), (dst_client_id, destination_name)] {
            let client = self.client(client_id)?;
            if !client.is_active() {
                warn!("cannot connect '{name}': owner '{}' is inactive", client.name);
                return Err(EngineError::ClientNotActive(client.name.clone()));
            }
        }

        let dst_is_driver = self.client(dst_client_id)?.is_driver();

        let (dir, counts_feeds) = if dst_is_driver {
            // Output connections into a driver are ignored for sorting.
            // Drivers run first anyway, and driver -> client -> driver
            // must not read as feedback.
            debug!("connect {source_name} and {destination_name} (output)");
            (Orientation::Forward, false)
        } else if src_client_id != dst_client_id {
            self.client_mut(src_client_id)?.truefeeds.push(dst_client_id);
            self.client_mut(dst_client_id)?.fedcount += 1;

            if self.client_feeds_transitive(dst_client_id, src_client_id) {
                // dest runs before source, so this edge closes a cycle
                debug!("connect {source_name} and {destination_name} (feedback)");
                self.client_mut(dst_client_id)?.sortfeeds.push(src_client_id);
                self.feedback_count += 1;
                debug!("feedback count up to {}", self.feedback_count);
                (Orientation::Feedback, true)
            } else {
                debug!("connect {source_name} and {destination_name} (forward)");
                self.client_mut(src_client_id)?.sortfeeds.push(dst_client_id);
                (Orientation::Forward, true)
            }
        } else {
            debug!("connect {source_name} and {destination_name} (self)");
            (Orientation::SelfConn, false)
        };

        let conn_id = self.insert_connection(ConnectionRecord {
            id: 0,
            src: src_id,
            dst: dst_id,
            src_client: src_client_id,
            dst_client: dst_client_id,
            dir,
            counts_feeds,
        });
        self.ports.get_mut(src_id)?.outgoing.push(conn_id);
        self.ports.get_mut(dst_id)?.incoming.push(conn_id);

        Ok(ConnectionEffect {
            src: src_id,
            dst: dst_id,
            src_client: src_client_id,
            dst_client: dst_client_id,
        })
    }

    pub fn disconnect(
        &mut self,
        control: &ControlShm,
        source_name: &str,
        destination_name: &str,
    ) -> EngineResult<ConnectionEffect> {
        let src_id = self.ports.find_by_name(source_name)?;
        let dst_id = self.ports.find_by_name(destination_name)?;
        self.disconnect_ids(control, src_id, dst_id)
    }

    pub fn disconnect_ids(
        &mut self,
        control: &ControlShm,
        src_id: PortId,
        dst_id: PortId,
    ) -> EngineResult<ConnectionEffect> {
        let had_feedback = self.feedback_count > 0;

        let conn_id = {
            let src = self.ports.get(src_id)?;
            src.outgoing
                .iter()
                .copied()
                .find(|c| self.connection(*c).is_some_and(|r| r.dst == dst_id))
        };
        let Some(conn_id) = conn_id else {
            let src_name = self.ports.get(src_id)?.name.clone();
            let dst_name = self.ports.get(dst_id)?.name.clone();
            return Err(EngineError::NotConnected(src_name, dst_name));
        };
        let record = self.remove_connection(control, conn_id)?;

        if had_feedback {
            self.check_acyclic();
        }

        Ok(ConnectionEffect {
            src: record.src,
            dst: record.dst,
            src_client: record.src_client,
            dst_client: record.dst_client,
        })
    }

    fn remove_connection(
        &mut self,
        control: &ControlShm,
        conn_id: ConnectionId,
    ) -> EngineResult<ConnectionRecord> {
        let record = self.connections[conn_id as usize]
            .take()
            .ok_or_else(|| EngineError::NotConnected(conn_id.to_string(), String::new()))?;
        self.free_connections.push(conn_id);

        {
            let src = self.ports.get_mut(record.src)?;
            src.outgoing.retain(|c| *c != conn_id);
        }
        let dst_remaining = {
            let dst = self.ports.get_mut(record.dst)?;
            dst.incoming.retain(|c| *c != conn_id);
            dst.incoming.len()
        };

        // last connection gone: any input monitoring on the reader is
        // stale now
        if dst_remaining == 0 {
            control
                .port(record.dst)
                .monitor_requests
                .store(0, AtomicOrdering::Relaxed);
        }

        if record.counts_feeds {
            self.client_mut(record.src_client)?
                .remove_truefeed(record.dst_client);
            self.client_mut(record.dst_client)?.fedcount -= 1;
            match record.dir {
                Orientation::Forward => {
                    self.client_mut(record.src_client)?
                        .remove_sortfeed(record.dst_client);
                }
                Orientation::Feedback => {
                    self.client_mut(record.dst_client)?
                        .remove_sortfeed(record.src_client);
                    self.feedback_count -= 1;
                    debug!("feedback count down to {}", self.feedback_count);
                }
                Orientation::SelfConn => {}
            }
        }

        debug!(
            "disconnected ports {} and {}",
            record.src, record.dst
        );
        Ok(record)
    }

    /// Clears every connection of one port.
    pub fn disconnect_all(
        &mut self,
        control: &ControlShm,
        port_id: PortId,
    ) -> EngineResult<Vec<ConnectionEffect>> {
        let port = self.ports.get(port_id)?;
        let conn_ids: Vec<ConnectionId> = port
            .incoming
            .iter()
            .chain(port.outgoing.iter())
            .copied()
            .collect();
        let had_feedback = self.feedback_count > 0;
        let mut effects = Vec::with_capacity(conn_ids.len());
        for conn_id in conn_ids {
            let record = self.remove_connection(control, conn_id)?;
            effects.push(ConnectionEffect {
                src: record.src,
                dst: record.dst,
                src_client: record.src_client,
                dst_client: record.dst_client,
            });
        }
        if had_feedback {
            self.check_acyclic();
        }
        Ok(effects)
    }

    /// Clears the connections of every port the client owns, used on
    /// zombification.
    pub fn disconnect_client_ports(
        &mut self,
        control: &ControlShm,
        client_id: ClientId,
    ) -> EngineResult<Vec<ConnectionEffect>> {
        let mut effects = Vec::new();
        for port_id in self.ports.ports_of_client(client_id) {
            effects.extend(self.disconnect_all(control, port_id)?);
        }
        Ok(effects)
    }

    /// Checks whether the graph has become acyclic and if so turns
    /// leftover feedback connections back into normal ones. This lowers
    /// latency at the cost of a one-cycle jump for readers that relied on
    /// the feedback delay.
    pub fn check_acyclic(&mut self) {
        debug!("checking whether the graph has become acyclic");

        for client in self.clients.values_mut() {
            client.tfedcount = client.fedcount;
        }
        let mut unsorted = self.clients.len();
        let mut stuck = false;

        while unsorted > 0 && !stuck {
            stuck = true;
            let ready: Vec<ClientId> = self
                .clients
                .values()
                .filter(|c| c.tfedcount == 0)
                .map(|c| c.id)
                .collect();
            for id in ready {
                stuck = false;
                unsorted -= 1;
                let truefeeds = {
                    let client = self
                        .clients
                        .get_mut(&id)
                        .expect("client vanished during acyclic check");
                    client.tfedcount = -1;
                    client.truefeeds.clone()
                };
                for fed in truefeeds {
                    if let Some(target) = self.clients.get_mut(&fed) {
                        target.tfedcount -= 1;
                    }
                }
            }
        }

        if stuck {
            debug!("graph is still cyclic");
            return;
        }

        debug!("graph has become acyclic");
        let feedback_ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .flatten()
            .filter(|c| c.dir == Orientation::Feedback)
            .map(|c| c.id)
            .collect();
        for conn_id in feedback_ids {
            let (src_client, dst_client) = {
                let record = self.connections[conn_id as usize]
                    .as_mut()
                    .expect("feedback connection vanished");
                record.dir = Orientation::Forward;
                (record.src_client, record.dst_client)
            };
            info!("reversing connection from client {src_client} to {dst_client}");
            if let Ok(dst) = self.client_mut(dst_client) {
                dst.remove_sortfeed(src_client);
            }
            if let Ok(src) = self.client_mut(src_client) {
                src.sortfeeds.push(dst_client);
            }
        }
        self.feedback_count = 0;
    }

    /// Orders clients so that every sortfeeds constraint is satisfied,
    /// with drivers forced to the front. Ties keep their previous
    /// relative order.
    pub fn sort_clients(&mut self) {
        let previous: HashMap<ClientId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut indegree: HashMap<ClientId, usize> = self.clients.keys().map(|id| (*id, 0)).collect();
        for client in self.clients.values() {
            let targets: HashSet<ClientId> = client.sortfeeds.iter().copied().collect();
            for target in targets {
                if let Some(count) = indegree.get_mut(&target) {
                    *count += 1;
                }
            }
        }

        let rank = |clients: &HashMap<ClientId, ClientInternal>, id: ClientId| {
            let is_driver = clients.get(&id).is_some_and(ClientInternal::is_driver);
            (!is_driver, previous.get(&id).copied().unwrap_or(usize::MAX), id)
        };

        let mut ready: Vec<ClientId> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut sorted = Vec::with_capacity(self.clients.len());

        while !ready.is_empty() {
            ready.sort_by_key(|id| rank(&self.clients, *id));
            let next = ready.remove(0);
            sorted.push(next);
            let targets: HashSet<ClientId> = self
                .clients
                .get(&next)
                .map(|c| c.sortfeeds.iter().copied().collect())
                .unwrap_or_default();
            for target in targets {
                if let Some(count) = indegree.get_mut(&target) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(target);
                    }
                }
            }
            indegree.remove(&next);
        }

        if !indegree.is_empty() {
            // sortfeeds is acyclic by construction; anything left points
            // at a bug upstream, keep the old relative order
            warn!("sort found residual cycle across {} clients", indegree.len());
            let mut rest: Vec<ClientId> = indegree.keys().copied().collect();
            rest.sort_by_key(|id| rank(&self.clients, *id));
            sorted.extend(rest);
        }

        self.order = sorted;
    }

    /// Walks the sorted list and assigns execution indices and subgraph
    /// FIFOs. External runs are chained through the FIFO ring, broken by
    /// internal clients which the engine calls directly. Returns the
    /// `GraphReordered` events to deliver, in emission order.
    pub fn rechain(&mut self, fifos: &mut FifoRing) -> io::Result<Vec<(ClientId, Event)>> {
        fifos.clear_all();
        let mut events = Vec::new();
        let mut n: u32 = 0;
        let mut subgraph_head: Option<ClientId> = None;

        debug!("++ rechain");

        for client_id in self.order.clone() {
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };
            if !client.is_active() || !client.has_process_chain() {
                continue;
            }
            let is_internal = client.is_internal();
            // this slot's index, taken before any subgraph boundary
            // bumps the fifo counter
            let execution_order = n;

            if is_internal {
                if let Some(head) = subgraph_head.take() {
                    fifos.get_or_create(n)?;
                    let head_client = self
                        .clients
                        .get_mut(&head)
                        .expect("subgraph head vanished during rechain");
                    head_client.subgraph_wait_fifo = Some(n);
                    debug!(
                        "client {}: wait fifo {n}",
                        head_client.name
                    );
                    n += 1;
                }
                let client = self
                    .clients
                    .get_mut(&client_id)
                    .expect("client vanished during rechain");
                client.execution_order = execution_order;
                client.subgraph_start_fifo = None;
                client.subgraph_wait_fifo = None;
                debug!(
                    "client {}: internal, execution order {execution_order}",
                    client.name
                );
                events.push((
                    client_id,
                    Event::GraphReordered {
                        fifo_index: 0,
                        upstream_is_engine: true,
                    },
                ));
            } else {
                let upstream_is_engine = if subgraph_head.is_none() {
                    // new subgraph: the engine starts the chain by
                    // writing to fifo n
                    fifos.get_or_create(n)?;
                    let client = self
                        .clients
                        .get_mut(&client_id)
                        .expect("client vanished during rechain");
                    client.subgraph_start_fifo = Some(n);
                    client.subgraph_wait_fifo = None;
                    subgraph_head = Some(client_id);
                    debug!("client {}: subgraph start fifo {n}", client.name);
                    true
                } else {
                    let client = self
                        .clients
                        .get_mut(&client_id)
                        .expect("client vanished during rechain");
                    client.subgraph_start_fifo = None;
                    client.subgraph_wait_fifo = None;
                    false
                };

                // make sure the fifo the client will signal exists before
                // it learns its position
                fifos.get_or_create(n + 1)?;
                let client = self
                    .clients
                    .get_mut(&client_id)
                    .expect("client vanished during rechain");
                client.execution_order = execution_order;
                events.push((
                    client_id,
                    Event::GraphReordered {
                        fifo_index: n,
                        upstream_is_engine,
                    },
                ));
                n += 1;
            }
        }

        if let Some(head) = subgraph_head {
            fifos.get_or_create(n)?;
            let head_client = self
                .clients
                .get_mut(&head)
                .expect("subgraph head vanished during rechain");
            head_client.subgraph_wait_fifo = Some(n);
            debug!(
                "client {}: wait fifo {n} (last subgraph)",
                head_client.name
            );
        }

        debug!("-- rechain");
        Ok(events)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        client::{ClientControlHandle, Lifecycle},
        formats::to_fixed_str,
        port::builtin_port_types,
        protocol::{PortFlags, callback_bits},
        shm::ClientControlShared,
    };
    use std::sync::atomic::Ordering;

    struct Fixture {
        control: ControlShm,
        graph: Graph,
        types: Vec<PortTypeInfo>,
    }

    fn heap_client(id: ClientId, name: &str, ctype: ClientType) -> ClientInternal {
        let control = ClientControlShared {
            id,
            name: to_fixed_str(name),
            ..Default::default()
        };
        control.active.store(1, Ordering::Relaxed);
        control
            .callbacks
            .store(callback_bits::PROCESS, Ordering::Relaxed);
        ClientInternal {
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
        }
    }

    fn fixture() -> Fixture {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = format!("jackd-rs-graph-test-{}-{n}", std::process::id());
        let control = ControlShm::create(&id, 32).expect("create failed");
        let types = builtin_port_types();
        for (i, t) in types.iter().enumerate() {
            control.header().port_types[i]
                .buffer_bytes
                .store(t.buffer_bytes(128) as u32, Ordering::Relaxed);
        }
        Fixture {
            control,
            graph: Graph::new(32, 2),
            types,
        }
    }

    impl Fixture {
        fn add_client(&mut self, id: ClientId, name: &str, ctype: ClientType) {
            self.graph.add_client(heap_client(id, name, ctype));
        }

        fn add_port(&mut self, client: ClientId, name: &str, flags: PortFlags) -> PortId {
            let client_name = self.graph.client(client).expect("client").name.clone();
            self.graph
                .ports
                .register(
                    &self.control,
                    client,
                    Uuid(client as u128 + 1),
                    &client_name,
                    name,
                    0,
                    &self.types[0],
                    flags,
                    false,
                )
                .expect("register failed")
        }

        fn connect(&mut self, src: &str, dst: &str) -> EngineResult<ConnectionEffect> {
            self.graph.connect(&self.types, src, dst)
        }

        fn pos(&self, id: ClientId) -> usize {
            self.graph
                .order
                .iter()
                .position(|c| *c == id)
                .expect("client not in order")
        }
    }

    fn two_client_graph() -> Fixture {
        let mut f = fixture();
        f.add_client(1, "a", ClientType::External);
        f.add_client(2, "b", ClientType::External);
        f.add_port(1, "out", PortFlags::IS_OUTPUT);
        f.add_port(1, "in", PortFlags::IS_INPUT);
        f.add_port(2, "out", PortFlags::IS_OUTPUT);
        f.add_port(2, "in", PortFlags::IS_INPUT);
        f
    }

    #[test]
    fn forward_connection_orders_clients() {
        let mut f = two_client_graph();
        f.connect("a:out", "b:in").expect("connect failed");
        f.graph.sort_clients();
        assert!(f.pos(1) < f.pos(2));
        assert_eq!(f.graph.client(2).expect("b").fedcount, 1);
    }

    #[test]
    fn duplicate_connection_is_rejected() {
        let mut f = two_client_graph();
        f.connect("a:out", "b:in").expect("connect failed");
        assert!(matches!(
            f.connect("a:out", "b:in"),
            Err(EngineError::AlreadyConnected(_, _))
        ));
    }

    #[test]
    fn incompatible_directions_are_rejected() {
        let mut f = two_client_graph();
        assert!(matches!(
            f.connect("a:in", "b:in"),
            Err(EngineError::IncompatiblePorts(_, _))
        ));
        assert!(matches!(
            f.connect("a:out", "b:out"),
            Err(EngineError::IncompatiblePorts(_, _))
        ));
    }

    #[test]
    fn feedback_connection_is_classified_and_reverts() {
        let mut f = two_client_graph();
        f.connect("a:out", "b:in").expect("forward failed");
        let effect = f.connect("b:out", "a:in").expect("feedback refused");
        assert_eq!(effect.src_client, 2);
        assert_eq!(f.graph.feedback_count, 1);

        // a still runs first: the feedback edge is reversed in sortfeeds
        f.graph.sort_clients();
        assert!(f.pos(1) < f.pos(2));

        // dropping the forward edge makes the graph acyclic again and the
        // feedback edge flips to forward: now b feeds a
        f.graph
            .disconnect(&f.control, "a:out", "b:in")
            .expect("disconnect failed");
        assert_eq!(f.graph.feedback_count, 0);
        f.graph.sort_clients();
        assert!(f.pos(2) < f.pos(1));
    }

    #[test]
    fn connection_sets_stay_symmetric() {
        let mut f = two_client_graph();
        f.connect("a:out", "b:in").expect("connect failed");
        let a_out = f.graph.ports.find_by_name("a:out").expect("a:out");
        let b_in = f.graph.ports.find_by_name("b:in").expect("b:in");
        let out_conns = &f.graph.ports.get(a_out).expect("port").outgoing;
        let in_conns = &f.graph.ports.get(b_in).expect("port").incoming;
        assert_eq!(out_conns, in_conns);

        f.graph
            .disconnect(&f.control, "a:out", "b:in")
            .expect("disconnect failed");
        assert!(f.graph.ports.get(a_out).expect("port").outgoing.is_empty());
        assert!(f.graph.ports.get(b_in).expect("port").incoming.is_empty());
    }

    #[test]
    fn driver_destination_does_not_create_feedback() {
        let mut f = fixture();
        f.add_client(0, "system", ClientType::Driver);
        f.add_client(1, "a", ClientType::External);
        f.add_port(0, "capture_1", PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL);
        f.add_port(0, "playback_1", PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL);
        f.add_port(1, "in", PortFlags::IS_INPUT);
        f.add_port(1, "out", PortFlags::IS_OUTPUT);

        f.connect("system:capture_1", "a:in").expect("capture failed");
        f.connect("a:out", "system:playback_1")
            .expect("playback failed");
        assert_eq!(f.graph.feedback_count, 0);
        f.graph.sort_clients();
        assert!(f.pos(0) < f.pos(1));
    }

    #[test]
    fn disconnect_all_clears_monitor_requests() {
        let mut f = two_client_graph();
        f.connect("a:out", "b:in").expect("connect failed");
        let b_in = f.graph.ports.find_by_name("b:in").expect("b:in");
        f.control
            .port(b_in)
            .monitor_requests
            .store(3, Ordering::Relaxed);
        f.graph
            .disconnect_all(&f.control, b_in)
            .expect("disconnect failed");
        assert_eq!(f.control.port(b_in).monitor_requests.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mixdown_gate_rejects_second_connection_without_mixdown() {
        let mut f = two_client_graph();
        // audio has a mixdown, so two connections are legal
        f.add_client(3, "c", ClientType::External);
        f.add_port(3, "out", PortFlags::IS_OUTPUT);
        f.connect("a:out", "b:in").expect("first failed");
        f.connect("c:out", "b:in").expect("second refused");
        let b_in = f.graph.ports.find_by_name("b:in").expect("b:in");
        assert_eq!(f.graph.ports.get(b_in).expect("port").incoming.len(), 2);
    }

    #[test]
    fn rechain_partitions_subgraphs_at_internal_clients() {
        let mut f = fixture();
        f.add_client(1, "ext1", ClientType::External);
        f.add_client(2, "ext2", ClientType::External);
        f.add_client(3, "int1", ClientType::Internal);
        f.add_client(4, "ext3", ClientType::External);
        f.graph.order = vec![1, 2, 3, 4];

        let ctx = crate::config::ServerContext::new(
            &format!("graph-rechain-{}", std::process::id()),
            Some(std::env::temp_dir()),
            false,
        );
        std::fs::create_dir_all(ctx.server_dir()).expect("mkdir failed");
        let mut fifos = FifoRing::new(ctx);
        let events = f.graph.rechain(&mut fifos).expect("rechain failed");

        // ext1 heads a subgraph [ext1, ext2], int1 breaks it, ext3 heads
        // its own
        let ext1 = f.graph.client(1).expect("ext1");
        assert_eq!(ext1.subgraph_start_fifo, Some(0));
        assert_eq!(ext1.subgraph_wait_fifo, Some(2));
        assert_eq!(ext1.execution_order, 0);
        let ext2 = f.graph.client(2).expect("ext2");
        assert_eq!(ext2.subgraph_start_fifo, None);
        assert_eq!(ext2.execution_order, 1);
        // the internal client takes the slot at the subgraph boundary,
        // sharing its index with the closing wait fifo
        let int1 = f.graph.client(3).expect("int1");
        assert_eq!(int1.execution_order, 2);
        let ext3 = f.graph.client(4).expect("ext3");
        assert_eq!(ext3.subgraph_start_fifo, Some(3));
        assert_eq!(ext3.subgraph_wait_fifo, Some(4));
        assert_eq!(ext3.execution_order, 3);

        let reorders: Vec<(ClientId, u32, bool)> = events
            .iter()
            .filter_map(|(id, e)| match e {
                Event::GraphReordered {
                    fifo_index,
                    upstream_is_engine,
                } => Some((*id, *fifo_index, *upstream_is_engine)),
                _ => None,
            })
            .collect();
        assert_eq!(
            reorders,
            vec![(1, 0, true), (2, 1, false), (3, 0, true), (4, 3, true)]
        );
    }
}
