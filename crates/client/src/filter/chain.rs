use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::filter::{Address, Downstream, Filter, FilterContext, Hop, Payload, Upstream, WriteId};
use crate::protocol::ClientError;

/// What a chain operation produced at its two ends.
#[derive(Debug, Default)]
pub struct ChainOutput {
    /// commands that reached the bottom, for the transport to carry out in order
    pub transport: Vec<Downstream>,
    /// events that reached the top, for the connection to handle in order
    pub events: Vec<Upstream>,
}

impl ChainOutput {
    pub fn is_empty(&self) -> bool {
        self.transport.is_empty() && self.events.is_empty()
    }
}

/// An ordered list of filters, index 0 being the one nearest the connection.
///
/// Every operation delivers one command or event and keeps routing whatever the
/// filters issue in reply, first in first out, until nothing is in flight.
///
/// A `StartTls` that reaches the bottom means no stage handled it, and the chain
/// answers with `HandshakeCompleted` on its own. Only raw bytes can be written to the
/// transport: any other payload reaching the bottom fails upwards.
pub struct FilterChain {
    stages: Vec<Box<dyn Filter>>,
    next_write_id: u64,
}

impl FilterChain {
    pub fn new(stages: Vec<Box<dyn Filter>>) -> Self {
        Self { stages, next_write_id: 0 }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn connect(&mut self, address: Address) -> ChainOutput {
        self.run(Hop::Down { to: 0, command: Downstream::Connect(address) })
    }

    /// Writes from the top of the chain.
    pub fn write(&mut self, payload: Payload) -> (WriteId, ChainOutput) {
        self.write_at(0, payload)
    }

    /// Writes entering the chain at `stage`, skipping the stages above it.
    pub fn write_at(&mut self, stage: usize, payload: Payload) -> (WriteId, ChainOutput) {
        self.next_write_id += 1;
        let id = WriteId(self.next_write_id);
        (id, self.run(Hop::Down { to: stage, command: Downstream::Write { payload, id } }))
    }

    pub fn start_tls(&mut self) -> ChainOutput {
        self.run(Hop::Down { to: 0, command: Downstream::StartTls })
    }

    pub fn close(&mut self) -> ChainOutput {
        self.run(Hop::Down { to: 0, command: Downstream::Close })
    }

    pub fn transport_connected(&mut self) -> ChainOutput {
        self.from_transport(Upstream::Connected)
    }

    pub fn transport_read(&mut self, bytes: Bytes) -> ChainOutput {
        self.from_transport(Upstream::Read(Payload::Bytes(bytes)))
    }

    pub fn transport_write_completed(&mut self, id: WriteId) -> ChainOutput {
        self.from_transport(Upstream::WriteCompleted(id))
    }

    pub fn transport_closed(&mut self) -> ChainOutput {
        self.from_transport(Upstream::ConnectionClosed)
    }

    pub fn transport_error(&mut self, error: ClientError) -> ChainOutput {
        self.from_transport(Upstream::Error(error))
    }

    fn bottom(&self) -> Option<usize> {
        self.stages.len().checked_sub(1)
    }

    fn from_transport(&mut self, event: Upstream) -> ChainOutput {
        let to = self.bottom();
        self.run(Hop::Up { to, event })
    }

    fn run(&mut self, hop: Hop) -> ChainOutput {
        let mut queue = VecDeque::from([hop]);
        let mut output = ChainOutput::default();

        while let Some(hop) = queue.pop_front() {
            match hop {
                Hop::Down { to, command } if to >= self.stages.len() => match command {
                    Downstream::StartTls => {
                        trace!("no secure stage, handshake completed");
                        queue.push_back(Hop::Up { to: self.bottom(), event: Upstream::HandshakeCompleted });
                    }
                    Downstream::Write { payload: Payload::Bytes(bytes), id } => {
                        output.transport.push(Downstream::Write { payload: Payload::Bytes(bytes), id });
                    }
                    Downstream::Write { payload, .. } => {
                        warn!(?payload, "message payload reached the transport");
                        let error = ClientError::body_stream("only bytes can be written to the transport");
                        queue.push_back(Hop::Up { to: self.bottom(), event: Upstream::Error(error) });
                    }
                    command => output.transport.push(command),
                },
                Hop::Down { to, command } => {
                    let mut cx = FilterContext { position: to, queue: &mut queue, next_write_id: &mut self.next_write_id };
                    self.stages[to].on_downstream(command, &mut cx);
                }
                Hop::Up { to: None, event } => output.events.push(event),
                Hop::Up { to: Some(to), event } => {
                    let mut cx = FilterContext { position: to, queue: &mut queue, next_write_id: &mut self.next_write_id };
                    self.stages[to].on_upstream(event, &mut cx);
                }
            }
        }

        output
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain").field("stages", &self.stages.len()).finish()
    }
}
