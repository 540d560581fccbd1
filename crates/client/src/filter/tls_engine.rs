//! The engine behind the TLS filter
//!
//! [`TlsEngine`] is the in-memory record layer the [`TlsFilter`](super::TlsFilter)
//! drives: `wrap` turns plaintext into records, `unwrap` turns records into plaintext,
//! and `handshake_status` says which of the two the handshake needs next.
//! [`RustlsEngine`] implements it over a `rustls::ClientConnection`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use tracing::trace;

use crate::protocol::TlsError;

/// What the handshake needs from the filter next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    /// reported once, right after a handshake completes
    Finished,
    NotHandshaking,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// more network bytes are needed to make progress
    BufferUnderflow,
    /// the destination cannot hold the output
    BufferOverflow,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub consumed: usize,
    pub produced: usize,
}

#[cfg_attr(test, mockall::automock)]
pub trait TlsEngine: Send {
    fn begin_handshake(&mut self) -> Result<(), TlsError>;

    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Encrypts as much of `src` as possible into `dst`, along with any pending handshake records.
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError>;

    /// Decrypts as much of `src` as possible into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError>;

    /// Runs one delegated task, returning `false` when none is left.
    fn run_delegated_task(&mut self) -> bool;

    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;

    fn is_outbound_done(&self) -> bool;

    fn peer_certificates(&self) -> Vec<CertificateDer<'static>>;
}

/// Extra check of the server identity, run once a handshake has completed.
pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, host: &str, certificates: &[CertificateDer<'static>]) -> bool;
}

impl<F> HostnameVerifier for F
where
    F: Fn(&str, &[CertificateDer<'static>]) -> bool + Send + Sync,
{
    fn verify(&self, host: &str, certificates: &[CertificateDer<'static>]) -> bool {
        self(host, certificates)
    }
}

pub struct RustlsEngine {
    connection: ClientConnection,
    handshaking: bool,
    outbound_closed: bool,
    inbound_closed: bool,
}

impl RustlsEngine {
    pub fn new(config: Arc<ClientConfig>, host: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(host.to_owned()).map_err(|_| TlsError::InvalidServerName(host.to_owned()))?;
        let connection = ClientConnection::new(config, name)?;
        Ok(Self { connection, handshaking: false, outbound_closed: false, inbound_closed: false })
    }

    fn status(&self) -> HandshakeStatus {
        if self.connection.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.connection.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else if self.handshaking {
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        EngineResult { status, handshake_status: self.status(), consumed, produced }
    }

    fn flush_records(&mut self, dst: &mut BytesMut) -> Result<usize, TlsError> {
        let before = dst.len();
        {
            let mut writer = (&mut *dst).writer();
            while self.connection.wants_write() {
                self.connection.write_tls(&mut writer).map_err(memory_io)?;
            }
        }
        Ok(dst.len() - before)
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        self.handshaking = true;
        Ok(())
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        let status = self.status();
        if status == HandshakeStatus::Finished {
            self.handshaking = false;
        }
        status
    }

    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
        if self.outbound_closed && !self.connection.wants_write() {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }

        let consumed = if src.is_empty() || self.outbound_closed {
            0
        } else {
            self.connection.writer().write(src).map_err(memory_io)?
        };
        let produced = self.flush_records(dst)?;
        Ok(self.result(EngineStatus::Ok, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsError> {
        if self.inbound_closed {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }
        if src.is_empty() {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }

        let mut reader = src;
        self.connection.read_tls(&mut reader).map_err(memory_io)?;
        let consumed = src.len() - reader.len();

        let state = self.connection.process_new_packets()?;
        let available = state.plaintext_bytes_to_read();
        let peer_closed = state.peer_has_closed();

        let start = dst.len();
        dst.resize(start + available, 0);
        let mut filled = 0;
        while filled < available {
            match self.connection.reader().read(&mut dst[start + filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(memory_io(e)),
            }
        }
        dst.truncate(start + filled);

        if peer_closed {
            trace!("peer sent close_notify");
            self.inbound_closed = true;
            return Ok(self.result(EngineStatus::Closed, consumed, filled));
        }

        let status = if consumed == 0 { EngineStatus::BufferUnderflow } else { EngineStatus::Ok };
        Ok(self.result(status, consumed, filled))
    }

    fn run_delegated_task(&mut self) -> bool {
        false
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.connection.send_close_notify();
            self.outbound_closed = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_closed
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.connection.wants_write()
    }

    fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.connection.peer_certificates().map(<[_]>::to_vec).unwrap_or_default()
    }
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.connection.is_handshaking())
            .field("outbound_closed", &self.outbound_closed)
            .field("inbound_closed", &self.inbound_closed)
            .finish()
    }
}

/// Reading from and writing to memory only fails on a broken session.
fn memory_io(e: io::Error) -> TlsError {
    TlsError::Handshake(rustls::Error::General(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::RootCertStore;

    fn config() -> Arc<ClientConfig> {
        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        Arc::new(config)
    }

    #[test]
    fn first_wrap_is_client_hello() {
        let mut engine = RustlsEngine::new(config(), "example.com").unwrap();
        engine.begin_handshake().unwrap();
        assert_eq!(engine.handshake_status(), HandshakeStatus::NeedWrap);

        let mut dst = BytesMut::new();
        let result = engine.wrap(&[], &mut dst).unwrap();
        assert_eq!(result.status, EngineStatus::Ok);
        assert_eq!(result.handshake_status, HandshakeStatus::NeedUnwrap);
        assert!(result.produced > 0);
        // handshake record type
        assert_eq!(dst[0], 0x16);
    }

    #[test]
    fn unwrap_without_data_underflows() {
        let mut engine = RustlsEngine::new(config(), "example.com").unwrap();
        let result = engine.unwrap(&[], &mut BytesMut::new()).unwrap();
        assert_eq!(result.status, EngineStatus::BufferUnderflow);
    }

    #[test]
    fn garbage_from_server_fails_handshake() {
        let mut engine = RustlsEngine::new(config(), "example.com").unwrap();
        engine.begin_handshake().unwrap();
        engine.wrap(&[], &mut BytesMut::new()).unwrap();

        let result = engine.unwrap(b"HTTP/1.1 400 Bad Request\r\n\r\n", &mut BytesMut::new());
        assert!(matches!(result, Err(TlsError::Handshake(_))));
    }

    #[test]
    fn invalid_server_name() {
        let result = RustlsEngine::new(config(), "not a host");
        assert!(matches!(result, Err(TlsError::InvalidServerName(_))));
    }

    #[test]
    fn closure_as_verifier() {
        let verifier = |host: &str, _: &[CertificateDer<'static>]| host == "example.com";
        assert!(verifier.verify("example.com", &[]));
        assert!(!HostnameVerifier::verify(&verifier, "other.com", &[]));
    }
}
