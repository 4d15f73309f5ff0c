//! Multi-client harness: a central sequencer plus N clients, each with a
//! sequence client and an interval collection. Ops are stamped in
//! submission order and delivered to every client (the submitter included,
//! which treats its own as the ack).
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use interval_collection::collection::CollectionOptions;
use interval_collection::ops::{
    ops_map, CollectionOp, OpHandler, OpMetadata, OpName, SequencedOp,
};
use interval_collection::sequence::{PendingTextOp, SequenceClient, SequencedTextOp};
use interval_collection::{IntervalCollection, Seq};

pub const LABEL: &str = "comments";

#[derive(Clone)]
pub enum Payload {
    Text(PendingTextOp),
    Interval(CollectionOp),
}

pub struct Outbound {
    pub payload: Payload,
    pub metadata: Option<OpMetadata>,
}

pub struct SequencedMsg {
    pub payload: Payload,
    pub origin: usize,
    pub client_id: String,
    pub ref_seq: Seq,
    pub seq: Seq,
    pub metadata: Option<OpMetadata>,
}

pub struct TestClient {
    pub name: String,
    pub client: SequenceClient,
    pub collection: IntervalCollection,
    pub outbox: Rc<RefCell<Vec<Outbound>>>,
}

impl TestClient {
    fn new(name: &str, options: CollectionOptions) -> Self {
        let client = SequenceClient::new(name);
        let collection = IntervalCollection::new(LABEL, Some(client.clone()), options);
        let outbox: Rc<RefCell<Vec<Outbound>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = outbox.clone();
        collection
            .attach(Box::new(move |op, metadata| {
                sink.borrow_mut().push(Outbound {
                    payload: Payload::Interval(op),
                    metadata: Some(metadata),
                });
            }))
            .expect("attach");
        TestClient {
            name: name.to_string(),
            client,
            collection,
            outbox,
        }
    }

    pub fn insert(&self, pos: usize, text: &str) {
        let pending = self.client.insert_local(pos, text);
        self.outbox.borrow_mut().push(Outbound {
            payload: Payload::Text(pending),
            metadata: None,
        });
    }

    pub fn remove(&self, start: usize, end: usize) {
        let pending = self.client.remove_local(start, end);
        self.outbox.borrow_mut().push(Outbound {
            payload: Payload::Text(pending),
            metadata: None,
        });
    }

    /// Resolved (start, end) of an interval by id.
    pub fn positions(&self, id: &str) -> (i64, i64) {
        let interval = self
            .collection
            .get_interval_by_id(id)
            .expect("interval not found");
        (interval.start_position(), interval.end_position())
    }
}

pub struct World {
    pub clients: Vec<TestClient>,
    handlers: HashMap<OpName, OpHandler>,
    log: Vec<SequencedMsg>,
    delivered: Vec<usize>,
    next_seq: Seq,
}

impl World {
    pub fn new(names: &[&str]) -> Self {
        Self::with_options(names, CollectionOptions::default())
    }

    pub fn with_options(names: &[&str], options: CollectionOptions) -> Self {
        World {
            clients: names.iter().map(|n| TestClient::new(n, options)).collect(),
            handlers: ops_map(),
            log: Vec::new(),
            delivered: vec![0; names.len()],
            next_seq: 0,
        }
    }

    pub fn client(&self, idx: usize) -> &TestClient {
        &self.clients[idx]
    }

    /// Stamp everything in one client's outbox into the sequencer log.
    pub fn sequence_from(&mut self, idx: usize) {
        let outbound: Vec<Outbound> = self.clients[idx].outbox.borrow_mut().drain(..).collect();
        for out in outbound {
            self.next_seq += 1;
            let ref_seq = match &out.payload {
                Payload::Text(pending) => pending.ref_seq,
                Payload::Interval(_) => self.clients[idx].client.get_current_seq(),
            };
            self.log.push(SequencedMsg {
                payload: out.payload,
                origin: idx,
                client_id: self.clients[idx].name.clone(),
                ref_seq,
                seq: self.next_seq,
                metadata: out.metadata,
            });
        }
    }

    /// Deliver every sequenced message each client has not seen yet.
    pub fn deliver_all(&mut self) {
        for idx in 0..self.clients.len() {
            self.deliver_to(idx);
        }
    }

    /// Deliver the outstanding log to one client (reconnect catch-up).
    pub fn deliver_to(&mut self, idx: usize) {
        while self.delivered[idx] < self.log.len() {
            let at = self.delivered[idx];
            self.delivered[idx] += 1;
            self.deliver(idx, at);
        }
    }

    fn deliver(&self, idx: usize, at: usize) {
        let msg = &self.log[at];
        let client = &self.clients[idx];
        let local = msg.origin == idx;
        match &msg.payload {
            Payload::Text(pending) => {
                client.client.apply(&SequencedTextOp {
                    op: pending.op.clone(),
                    client_id: pending.client_id.clone(),
                    ref_seq: msg.ref_seq,
                    seq: msg.seq,
                    local_seq: pending.local_seq,
                });
            }
            Payload::Interval(op) => {
                let handler = &self.handlers[&op.name];
                let sequenced = SequencedOp {
                    sequence_number: msg.seq,
                    reference_sequence_number: msg.ref_seq,
                    client_id: msg.client_id.as_str().into(),
                };
                (handler.process)(
                    &client.collection,
                    &op.value,
                    local,
                    &sequenced,
                    if local { msg.metadata.as_ref() } else { None },
                );
                client.client.advance_current_seq(msg.seq);
            }
        }
        client.collection.check();
    }

    /// Sequence every client's outbox (client order) and deliver it all.
    pub fn settle(&mut self) {
        for idx in 0..self.clients.len() {
            self.sequence_from(idx);
        }
        self.deliver_all();
    }

    /// Rebase one disconnected client's pending interval ops against its
    /// now-caught-up state, dropping ops whose text is gone. Call after
    /// delivering the remote backlog and before sequencing the client.
    pub fn rebase_pending(&mut self, idx: usize) {
        let client = &self.clients[idx];
        client.client.normalize();
        let outbound: Vec<Outbound> = client.outbox.borrow_mut().drain(..).collect();
        let mut kept = Vec::new();
        for out in outbound {
            match out.payload {
                Payload::Interval(op) => {
                    let metadata = out.metadata.expect("interval op without metadata");
                    let handler = &self.handlers[&op.name];
                    if let Some((op, metadata)) =
                        (handler.rebase)(&client.collection, op, metadata)
                    {
                        kept.push(Outbound {
                            payload: Payload::Interval(op),
                            metadata: Some(metadata),
                        });
                    }
                }
                payload @ Payload::Text(_) => kept.push(Outbound {
                    payload,
                    metadata: out.metadata,
                }),
            }
        }
        *client.outbox.borrow_mut() = kept;
    }

    /// Assert every client resolves the same (id, start, end, properties)
    /// tuples.
    pub fn assert_converged(&self) {
        let snapshot = |client: &TestClient| {
            let mut rows: Vec<(String, i64, i64, String)> = client
                .collection
                .iter()
                .map(|interval| {
                    let mut props: Vec<(String, String)> = interval
                        .properties_snapshot()
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    props.sort();
                    (
                        interval.id().unwrap_or_default().to_string(),
                        interval.start_position(),
                        interval.end_position(),
                        format!("{props:?}"),
                    )
                })
                .collect();
            rows.sort();
            rows
        };
        let first = snapshot(&self.clients[0]);
        for client in &self.clients[1..] {
            assert_eq!(
                first,
                snapshot(client),
                "clients {} and {} diverged",
                self.clients[0].name,
                client.name
            );
        }
        for (a, b) in self.clients.iter().zip(&self.clients[1..]) {
            assert_eq!(a.client.text(), b.client.text(), "text diverged");
        }
    }
}
