//! TLS-PSK sessions backed by OpenSSL
//!
//! OpenSSL runs over an in-memory pipe so the session fits the sans-I/O
//! [`TlsSession`] shape. Only TLS 1.2 PSK cipher suites are offered; the
//! server callback resolves identities through [`PskCredentials::lookup`]
//! and answers an unknown identity with an empty key, which aborts the
//! handshake.

use std::io::{self, Read, Write};
use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVersion,
};
use tracing::debug;

use super::error::TlsError;
use super::tls::{Handshake, Plaintext, PskBackend, PskCredentials, TlsSession};

/// Cipher suites offered and accepted in PSK mode
pub const PSK_CIPHERS: &str = "kECDHEPSK+AES128:kPSK+AES128";

/// [`PskBackend`] producing OpenSSL sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensslPsk;

impl PskBackend for OpensslPsk {
    fn client_session(
        &self,
        credentials: Arc<PskCredentials>,
    ) -> Result<Box<dyn TlsSession>, TlsError> {
        let mut builder = context_builder(SslMethod::tls_client())?;
        builder.set_psk_client_callback(move |_ssl, _hint, identity_out, key_out| {
            let identity = credentials.identity().as_bytes();
            let key = credentials.key();
            // identity is written NUL-terminated
            if identity.len() >= identity_out.len() || key.len() > key_out.len() {
                return Err(ErrorStack::get());
            }
            identity_out[..identity.len()].copy_from_slice(identity);
            identity_out[identity.len()] = 0;
            key_out[..key.len()].copy_from_slice(key);
            Ok(key.len())
        });

        let mut ssl = Ssl::new(&builder.build()).map_err(config_error)?;
        ssl.set_connect_state();
        Ok(Box::new(OpensslSession::new(ssl)?))
    }

    fn server_session(
        &self,
        credentials: Arc<PskCredentials>,
    ) -> Result<Box<dyn TlsSession>, TlsError> {
        let mut builder = context_builder(SslMethod::tls_server())?;
        builder.set_psk_server_callback(move |_ssl, identity, key_out| {
            match identity.and_then(|identity| credentials.lookup(identity)) {
                Some(key) if key.len() <= key_out.len() => {
                    key_out[..key.len()].copy_from_slice(key);
                    Ok(key.len())
                }
                _ => {
                    debug!("rejecting unknown PSK identity");
                    Ok(0)
                }
            }
        });

        let mut ssl = Ssl::new(&builder.build()).map_err(config_error)?;
        ssl.set_accept_state();
        Ok(Box::new(OpensslSession::new(ssl)?))
    }
}

fn context_builder(method: SslMethod) -> Result<SslContextBuilder, TlsError> {
    let mut builder = SslContext::builder(method).map_err(config_error)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(config_error)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(config_error)?;
    builder.set_cipher_list(PSK_CIPHERS).map_err(config_error)?;
    Ok(builder)
}

fn config_error(err: ErrorStack) -> TlsError {
    TlsError::Config(format!("cannot set up TLS-PSK: {err}"))
}

/// Ciphertext buffers standing in for the socket
#[derive(Debug, Default)]
struct MemoryPipe {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl Read for MemoryPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.inbound.len());
        buf[..n].copy_from_slice(&self.inbound[..n]);
        self.inbound.drain(..n);
        Ok(n)
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct OpensslSession {
    stream: SslStream<MemoryPipe>,
    ready: bool,
}

impl OpensslSession {
    fn new(ssl: Ssl) -> Result<Self, TlsError> {
        let stream = SslStream::new(ssl, MemoryPipe::default()).map_err(config_error)?;
        Ok(Self {
            stream,
            ready: false,
        })
    }

    fn pending_output(&self) -> bool {
        !self.stream.get_ref().outbound.is_empty()
    }
}

impl TlsSession for OpensslSession {
    fn handshake(&mut self) -> Result<Handshake, TlsError> {
        if !self.ready {
            match self.stream.do_handshake() {
                Ok(()) => self.ready = true,
                Err(e) if e.code() == ErrorCode::WANT_READ => {
                    return Ok(if self.pending_output() {
                        Handshake::WantWrite
                    } else {
                        Handshake::WantRead
                    });
                }
                Err(e) if e.code() == ErrorCode::WANT_WRITE => return Ok(Handshake::WantWrite),
                Err(e) => return Err(TlsError::Handshake(e.to_string())),
            }
        }

        Ok(if self.pending_output() {
            Handshake::WantWrite
        } else {
            Handshake::Complete
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Plaintext, TlsError> {
        match self.stream.ssl_read(buf) {
            Ok(0) => Ok(Plaintext::Closed),
            Ok(n) => Ok(Plaintext::Data(n)),
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(Plaintext::WantRead),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(Plaintext::Closed),
            Err(e) if e.code() == ErrorCode::SYSCALL && e.io_error().is_none() => {
                Ok(Plaintext::Closed)
            }
            Err(e) => Err(TlsError::Io(io::Error::other(e.to_string()))),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        match self.stream.ssl_write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => Ok(0),
            Err(e) => Err(TlsError::Io(io::Error::other(e.to_string()))),
        }
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn close(&mut self) {
        if self.ready {
            // close_notify is best effort; the socket is shut down right after
            let _ = self.stream.shutdown();
        }
    }

    fn receive(&mut self, ciphertext: &[u8]) -> Result<usize, TlsError> {
        self.stream.get_mut().inbound.extend_from_slice(ciphertext);
        Ok(ciphertext.len())
    }

    fn transmit(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let pending = &mut self.stream.get_mut().outbound;
        let produced = pending.len();
        out.append(pending);
        Ok(produced)
    }
}
