//! TLS stage of the filter chain
//!
//! The filter is transparent until it receives `StartTls`, so that a proxy tunnel can be
//! negotiated in plain text first. It then drives its [`TlsEngine`] through the
//! handshake and, once the session is up, encrypts every write and decrypts every read.
//!
//! Writes are refused while the first handshake runs. During a later re-handshake one
//! write is held back and sent once the session is usable again; a second one fails.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::filter::{Downstream, EngineStatus, Filter, FilterContext, HandshakeStatus, HostnameVerifier, Payload, TlsEngine, Upstream, WriteId};
use crate::protocol::{ClientError, TlsError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TlsState {
    NotStarted,
    Handshaking,
    Data,
    Rehandshaking,
    Closed,
}

pub struct TlsFilter {
    engine: Box<dyn TlsEngine>,
    host: String,
    verifier: Option<Arc<dyn HostnameVerifier>>,
    state: TlsState,
    network_in: BytesMut,
    /// application data decrypted while a handshake was still running
    handshake_plaintext: BytesMut,
    held_write: Option<(Bytes, WriteId)>,
    /// network writes not completed yet, with the write they carry, if any
    in_flight: VecDeque<(WriteId, Option<WriteId>)>,
}

impl TlsFilter {
    pub fn new<S: Into<String>>(engine: Box<dyn TlsEngine>, host: S) -> Self {
        Self {
            engine,
            host: host.into(),
            verifier: None,
            state: TlsState::NotStarted,
            network_in: BytesMut::new(),
            handshake_plaintext: BytesMut::new(),
            held_write: None,
            in_flight: VecDeque::new(),
        }
    }

    pub fn with_hostname_verifier(mut self, verifier: Option<Arc<dyn HostnameVerifier>>) -> Self {
        self.verifier = verifier;
        self
    }

    fn start(&mut self, cx: &mut FilterContext<'_>) {
        if self.state != TlsState::NotStarted {
            warn!(state = ?self.state, "secure session already started");
            return;
        }

        trace!(host = %self.host, "starting handshake");
        self.state = TlsState::Handshaking;
        if let Err(e) = self.engine.begin_handshake() {
            self.fail(e, cx);
            return;
        }
        self.handshake(cx);
    }

    fn handshake(&mut self, cx: &mut FilterContext<'_>) {
        loop {
            match self.engine.handshake_status() {
                HandshakeStatus::NeedWrap => {
                    let mut records = BytesMut::new();
                    match self.engine.wrap(&[], &mut records) {
                        Ok(result) if result.status == EngineStatus::Closed => {
                            self.fail(TlsError::SessionClosed, cx);
                            return;
                        }
                        Ok(_) => self.send_records(records, None, cx),
                        Err(e) => {
                            self.fail(e, cx);
                            return;
                        }
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    match self.engine.unwrap(&self.network_in, &mut self.handshake_plaintext) {
                        Ok(result) => {
                            self.network_in.advance(result.consumed);
                            match result.status {
                                EngineStatus::BufferUnderflow => break,
                                EngineStatus::Closed => {
                                    self.fail(TlsError::SessionClosed, cx);
                                    return;
                                }
                                EngineStatus::BufferOverflow => {
                                    error!(host = %self.host, "tls engine overflowed a growable buffer during handshake");
                                    panic!("handshake output exceeds a growable buffer");
                                }
                                EngineStatus::Ok => {}
                            }
                            if result.consumed == 0 && result.produced == 0 {
                                break;
                            }
                        }
                        Err(e) => {
                            self.fail(e, cx);
                            return;
                        }
                    }
                }
                HandshakeStatus::NeedTask => while self.engine.run_delegated_task() {},
                HandshakeStatus::Finished => {
                    self.handshake_finished(cx);
                    return;
                }
                HandshakeStatus::NotHandshaking => {
                    if self.state == TlsState::Rehandshaking {
                        self.handshake_finished(cx);
                    }
                    return;
                }
            }
        }

        // data keeps flowing while the session renegotiates
        if self.state == TlsState::Rehandshaking {
            self.flush_handshake_plaintext(cx);
        }
    }

    fn flush_handshake_plaintext(&mut self, cx: &mut FilterContext<'_>) {
        if !self.handshake_plaintext.is_empty() {
            cx.emit(Upstream::Read(Payload::Bytes(self.handshake_plaintext.split().freeze())));
        }
    }

    fn handshake_finished(&mut self, cx: &mut FilterContext<'_>) {
        if let Some(verifier) = &self.verifier
            && !verifier.verify(&self.host, &self.engine.peer_certificates())
        {
            error!(host = %self.host, "server host name verification failed");
            self.fail(TlsError::HostnameVerification { host: self.host.clone() }, cx);
            return;
        }

        let previous = std::mem::replace(&mut self.state, TlsState::Data);
        debug!(host = %self.host, ?previous, "handshake completed");

        if previous == TlsState::Handshaking {
            cx.emit(Upstream::HandshakeCompleted);
        }
        self.flush_handshake_plaintext(cx);
        if let Some((data, id)) = self.held_write.take() {
            self.encrypt(&data, Some(id), cx);
        }
        if !self.network_in.is_empty() {
            self.decrypt(cx);
        }
    }

    fn encrypt(&mut self, data: &[u8], id: Option<WriteId>, cx: &mut FilterContext<'_>) {
        let mut src = data;
        let mut records = BytesMut::with_capacity(data.len() + 64);

        loop {
            match self.engine.wrap(src, &mut records) {
                Ok(result) => {
                    src = &src[result.consumed..];
                    match result.status {
                        EngineStatus::Closed => {
                            self.fail(TlsError::SessionClosed, cx);
                            return;
                        }
                        EngineStatus::BufferOverflow => records.reserve(records.capacity().max(1024)),
                        EngineStatus::Ok | EngineStatus::BufferUnderflow => {}
                    }
                    if src.is_empty() {
                        break;
                    }
                    if result.consumed == 0 && result.status != EngineStatus::BufferOverflow {
                        self.fail(TlsError::SessionClosed, cx);
                        return;
                    }
                }
                Err(e) => {
                    self.fail(e, cx);
                    return;
                }
            }
        }

        self.send_records(records, id, cx);
    }

    fn decrypt(&mut self, cx: &mut FilterContext<'_>) {
        let mut plaintext = BytesMut::new();
        let mut rehandshake = false;
        let mut closed = false;

        while !self.network_in.is_empty() {
            match self.engine.unwrap(&self.network_in, &mut plaintext) {
                Ok(result) => {
                    self.network_in.advance(result.consumed);
                    match result.status {
                        EngineStatus::BufferUnderflow => break,
                        EngineStatus::Closed => {
                            closed = true;
                            break;
                        }
                        EngineStatus::BufferOverflow => {
                            error!(host = %self.host, "tls engine overflowed a growable buffer while decrypting");
                            panic!("plaintext exceeds a growable buffer");
                        }
                        EngineStatus::Ok => {}
                    }
                    if matches!(result.handshake_status, HandshakeStatus::NeedWrap | HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedTask) {
                        rehandshake = true;
                        break;
                    }
                    if result.consumed == 0 {
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e, cx);
                    return;
                }
            }
        }

        if !plaintext.is_empty() {
            cx.emit(Upstream::Read(Payload::Bytes(plaintext.freeze())));
        }

        if closed {
            debug!(host = %self.host, "server closed the secure session");
            self.state = TlsState::Closed;
            cx.emit(Upstream::ConnectionClosed);
        } else if rehandshake {
            trace!(host = %self.host, "re-handshake requested");
            self.state = TlsState::Rehandshaking;
            self.handshake(cx);
        }
    }

    fn send_records(&mut self, records: BytesMut, carried: Option<WriteId>, cx: &mut FilterContext<'_>) {
        if records.is_empty() {
            if let Some(id) = carried {
                cx.emit(Upstream::WriteCompleted(id));
            }
            return;
        }
        let id = cx.next_write_id();
        self.in_flight.push_back((id, carried));
        cx.write(Payload::Bytes(records.freeze()), id);
    }

    fn write(&mut self, data: Bytes, id: WriteId, cx: &mut FilterContext<'_>) {
        match self.state {
            TlsState::NotStarted => {
                self.in_flight.push_back((id, Some(id)));
                cx.write(Payload::Bytes(data), id);
            }
            TlsState::Handshaking => cx.fail(TlsError::HandshakeInProgress.into()),
            TlsState::Rehandshaking => {
                if self.held_write.is_some() {
                    cx.fail(TlsError::WriteInProgress.into());
                } else {
                    self.held_write = Some((data, id));
                }
            }
            TlsState::Data => self.encrypt(&data, Some(id), cx),
            TlsState::Closed => cx.fail(TlsError::SessionClosed.into()),
        }
    }

    fn close(&mut self, cx: &mut FilterContext<'_>) {
        if matches!(self.state, TlsState::Handshaking | TlsState::Data | TlsState::Rehandshaking) {
            self.engine.close_outbound();
            let mut records = BytesMut::new();
            loop {
                match self.engine.wrap(&[], &mut records) {
                    Ok(result) if result.produced > 0 && !self.engine.is_outbound_done() => {}
                    _ => break,
                }
            }
            self.send_records(records, None, cx);
        }
        self.state = TlsState::Closed;
        cx.close();
    }

    fn fail(&mut self, e: TlsError, cx: &mut FilterContext<'_>) {
        error!(host = %self.host, "secure session failed, cause: {}", e);
        self.state = TlsState::Closed;
        self.held_write = None;
        self.handshake_plaintext.clear();
        cx.fail(ClientError::from(e));
    }
}

impl Filter for TlsFilter {
    fn on_downstream(&mut self, command: Downstream, cx: &mut FilterContext<'_>) {
        match command {
            Downstream::StartTls => self.start(cx),
            Downstream::Write { payload: Payload::Bytes(data), id } => self.write(data, id, cx),
            Downstream::Close => self.close(cx),
            command => cx.send(command),
        }
    }

    fn on_upstream(&mut self, event: Upstream, cx: &mut FilterContext<'_>) {
        match event {
            Upstream::Read(Payload::Bytes(bytes)) => match self.state {
                TlsState::NotStarted => cx.emit(Upstream::Read(Payload::Bytes(bytes))),
                TlsState::Handshaking | TlsState::Rehandshaking => {
                    self.network_in.extend_from_slice(&bytes);
                    self.handshake(cx);
                }
                TlsState::Data => {
                    self.network_in.extend_from_slice(&bytes);
                    self.decrypt(cx);
                }
                TlsState::Closed => trace!(len = bytes.len(), "dropping data read after the session closed"),
            },
            Upstream::WriteCompleted(id) => match self.in_flight.iter().position(|(network_id, _)| *network_id == id) {
                Some(index) => {
                    if let Some((_, Some(carried))) = self.in_flight.remove(index) {
                        cx.emit(Upstream::WriteCompleted(carried));
                    }
                }
                None => trace!(?id, "dropping completion of an unknown write"),
            },
            event @ (Upstream::ConnectionClosed | Upstream::Error(_)) => {
                if self.state == TlsState::Data && matches!(event, Upstream::ConnectionClosed) && !self.engine.is_inbound_done() {
                    debug!(host = %self.host, "transport closed without close_notify");
                }
                if self.state != TlsState::NotStarted {
                    self.state = TlsState::Closed;
                }
                cx.emit(event);
            }
            event => cx.emit(event),
        }
    }
}

impl std::fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFilter").field("host", &self.host).field("state", &self.state).finish()
    }
}
