//! TLS layering
//!
//! The framing code never talks to a TLS library directly. A [`TlsSession`]
//! is a sans-I/O engine: ciphertext is pushed in with `receive`, pulled out
//! with `transmit`, and plaintext flows through `read`/`write`.
//! [`TlsChannel`] drives a session over an async socket, looping on
//! "want read"/"want write" until the handshake or the I/O completes.
//!
//! Certificate mode is backed by rustls. PSK mode goes through a
//! [`PskBackend`]; the `tls-psk` feature provides one built on OpenSSL.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use zeroize::Zeroizing;

use super::error::TlsError;

/// First byte of a TLS handshake record
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const CLIENT_HELLO: u8 = 0x01;

const MIN_PSK_HEX_DIGITS: usize = 32;
const MAX_PSK_HEX_DIGITS: usize = 512;
const MAX_PSK_IDENTITY_LEN: usize = 128;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Unencrypted,
    Psk,
    Cert,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Unencrypted => "unencrypted",
            TlsMode::Psk => "psk",
            TlsMode::Cert => "cert",
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake progress reported by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Complete,
    WantRead,
    WantWrite,
}

/// Outcome of a plaintext read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plaintext {
    Data(usize),
    WantRead,
    Closed,
}

/// A TLS engine operating on in-memory buffers
pub trait TlsSession: Send {
    /// Report what the handshake needs next
    fn handshake(&mut self) -> Result<Handshake, TlsError>;

    /// Read decrypted application data
    fn read(&mut self, buf: &mut [u8]) -> Result<Plaintext, TlsError>;

    /// Queue application data for encryption; returns bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize, TlsError>;

    /// Handshake finished
    fn ready(&self) -> bool;

    /// Queue a close notification
    fn close(&mut self);

    /// Feed ciphertext received from the peer; returns bytes consumed
    fn receive(&mut self, ciphertext: &[u8]) -> Result<usize, TlsError>;

    /// Move pending ciphertext into `out`; returns bytes produced
    fn transmit(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError>;
}

/// Session backed by rustls
pub struct RustlsSession {
    conn: rustls::Connection,
}

impl RustlsSession {
    pub fn client(config: Arc<ClientConfig>, host: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name \"{host}\": {e}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| TlsError::Config(format!("cannot create client session: {e}")))?;
        Ok(Self { conn: conn.into() })
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config)
            .map_err(|e| TlsError::Config(format!("cannot create server session: {e}")))?;
        Ok(Self { conn: conn.into() })
    }
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self) -> Result<Handshake, TlsError> {
        if self.conn.wants_write() {
            Ok(Handshake::WantWrite)
        } else if self.conn.is_handshaking() {
            Ok(Handshake::WantRead)
        } else {
            Ok(Handshake::Complete)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Plaintext, TlsError> {
        match self.conn.reader().read(buf) {
            Ok(0) => Ok(Plaintext::Closed),
            Ok(n) => Ok(Plaintext::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Plaintext::WantRead),
            Err(e) => Err(TlsError::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        Ok(self.conn.writer().write(data)?)
    }

    fn ready(&self) -> bool {
        !self.conn.is_handshaking()
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
    }

    fn receive(&mut self, ciphertext: &[u8]) -> Result<usize, TlsError> {
        let mut cursor = ciphertext;
        let consumed = self.conn.read_tls(&mut cursor)?;
        if consumed == 0 && !ciphertext.is_empty() {
            return Err(TlsError::BufferExhausted);
        }
        self.conn
            .process_new_packets()
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(consumed)
    }

    fn transmit(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let mut produced = 0;
        while self.conn.wants_write() {
            produced += self.conn.write_tls(out)?;
        }
        Ok(produced)
    }
}

/// Drives a [`TlsSession`] over a socket
pub struct TlsChannel<S> {
    stream: S,
    session: Box<dyn TlsSession>,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    scratch: Vec<u8>,
}

impl<S> TlsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, session: Box<dyn TlsSession>) -> Self {
        Self {
            stream,
            session,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            scratch: vec![0; READ_CHUNK],
        }
    }

    pub async fn handshake(&mut self) -> Result<(), TlsError> {
        loop {
            match self.session.handshake()? {
                Handshake::Complete => {
                    self.send_pending().await?;
                    trace!("TLS handshake complete");
                    return Ok(());
                }
                Handshake::WantWrite => self.send_pending().await?,
                Handshake::WantRead => {
                    if !self.receive_more().await? {
                        return Err(TlsError::Handshake(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Read plaintext; 0 means the peer closed the connection
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        loop {
            match self.session.read(buf)? {
                Plaintext::Data(n) => return Ok(n),
                Plaintext::Closed => return Ok(0),
                Plaintext::WantRead => {
                    self.send_pending().await?;
                    if !self.receive_more().await? {
                        return Ok(0);
                    }
                }
            }
        }
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), TlsError> {
        while !data.is_empty() {
            let mut written = self.session.write(data)?;
            if written == 0 {
                self.send_pending().await?;
                written = self.session.write(data)?;
                if written == 0 {
                    return Err(TlsError::BufferExhausted);
                }
            }
            self.send_pending().await?;
            data = &data[written..];
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TlsError> {
        self.session.close();
        self.send_pending().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.session.ready()
    }

    async fn send_pending(&mut self) -> Result<(), TlsError> {
        self.outgoing.clear();
        self.session.transmit(&mut self.outgoing)?;
        if !self.outgoing.is_empty() {
            self.stream.write_all(&self.outgoing).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Feed more ciphertext into the session; `false` on EOF
    async fn receive_more(&mut self) -> Result<bool, TlsError> {
        if self.incoming.is_empty() {
            let n = self.stream.read(&mut self.scratch).await?;
            if n == 0 {
                return Ok(false);
            }
            self.incoming.extend_from_slice(&self.scratch[..n]);
        }

        let consumed = self.session.receive(&self.incoming)?;
        self.incoming.drain(..consumed);
        Ok(true)
    }
}

/// Certificate-mode client and server configuration
#[derive(Clone)]
pub struct CertificateContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl CertificateContext {
    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let ca_certs = parse_certificates(ca_pem)?;
        if ca_certs.is_empty() {
            return Err(TlsError::Certificate("no CA certificates found".into()));
        }

        let mut root_store = RootCertStore::empty();
        for cert in &ca_certs {
            root_store.add(cert.clone()).map_err(|e| {
                TlsError::Certificate(format!("failed to add CA certificate: {e}"))
            })?;
        }

        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(TlsError::Certificate("no agent certificates found".into()));
        }
        let key = parse_private_key(key_pem)?;

        let client = ClientConfig::builder()
            .with_root_certificates(root_store.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| TlsError::Config(format!("client config error: {e}")))?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| TlsError::Config(format!("client verifier error: {e}")))?;

        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("server config error: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn from_files(ca: &Path, cert: &Path, key: &Path) -> Result<Self, TlsError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                TlsError::Config(format!("cannot read \"{}\": {e}", path.display()))
            })
        };
        let key_pem = Zeroizing::new(read(key)?);
        Self::from_pem(&read(ca)?, &read(cert)?, &key_pem)
    }

    pub fn client_session(&self, host: &str) -> Result<RustlsSession, TlsError> {
        RustlsSession::client(self.client.clone(), host)
    }

    pub fn server_session(&self) -> Result<RustlsSession, TlsError> {
        RustlsSession::server(self.server.clone())
    }
}

impl fmt::Debug for CertificateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateContext").finish_non_exhaustive()
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))
}

/// Pre-shared key identity and secret
pub struct PskCredentials {
    identity: String,
    key: Zeroizing<Vec<u8>>,
}

impl PskCredentials {
    /// `key_hex` must hold between 32 and 512 hexadecimal digits
    pub fn new(identity: impl Into<String>, key_hex: &str) -> Result<Self, TlsError> {
        let identity = identity.into();
        if identity.is_empty() || identity.len() > MAX_PSK_IDENTITY_LEN {
            return Err(TlsError::Psk(format!(
                "identity must be 1 to {MAX_PSK_IDENTITY_LEN} bytes long"
            )));
        }

        let key_hex = key_hex.trim();
        if !(MIN_PSK_HEX_DIGITS..=MAX_PSK_HEX_DIGITS).contains(&key_hex.len()) {
            return Err(TlsError::Psk(format!(
                "key must hold {MIN_PSK_HEX_DIGITS} to {MAX_PSK_HEX_DIGITS} hexadecimal digits"
            )));
        }
        let key = hex::decode(key_hex)
            .map_err(|e| TlsError::Psk(format!("invalid key: {e}")))?;

        Ok(Self {
            identity,
            key: Zeroizing::new(key),
        })
    }

    pub fn from_file(identity: impl Into<String>, path: &Path) -> Result<Self, TlsError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            TlsError::Psk(format!("cannot read \"{}\": {e}", path.display()))
        })?);
        Self::new(identity, &contents)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Key for the identity the peer presented; anything else gets nothing
    pub fn lookup(&self, identity: &[u8]) -> Option<&[u8]> {
        if identity.is_empty() || self.key.is_empty() {
            return None;
        }
        (identity == self.identity.as_bytes()).then_some(self.key.as_slice())
    }

    /// Key to offer as a client
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// TLS-PSK engine provider
///
/// Server sessions must resolve the peer identity through
/// [`PskCredentials::lookup`].
pub trait PskBackend: Send + Sync {
    fn client_session(
        &self,
        credentials: Arc<PskCredentials>,
    ) -> Result<Box<dyn TlsSession>, TlsError>;

    fn server_session(
        &self,
        credentials: Arc<PskCredentials>,
    ) -> Result<Box<dyn TlsSession>, TlsError>;
}

/// Everything needed to open TLS sessions in either mode
#[derive(Clone, Default)]
pub struct TlsContexts {
    pub certificate: Option<CertificateContext>,
    pub psk: Option<Arc<PskCredentials>>,
    pub psk_backend: Option<Arc<dyn PskBackend>>,
}

impl TlsContexts {
    fn psk_parts(&self) -> Result<(Arc<PskCredentials>, &Arc<dyn PskBackend>), TlsError> {
        let credentials = self.psk.clone().ok_or(TlsError::NotConfigured("psk"))?;
        let backend = self.psk_backend.as_ref().ok_or_else(|| {
            TlsError::Psk("no TLS-PSK implementation is available".to_string())
        })?;
        Ok((credentials, backend))
    }

    /// Session for an outgoing connection, `None` for cleartext
    pub fn client_session(
        &self,
        mode: TlsMode,
        host: &str,
    ) -> Result<Option<Box<dyn TlsSession>>, TlsError> {
        match mode {
            TlsMode::Unencrypted => Ok(None),
            TlsMode::Cert => {
                let context = self
                    .certificate
                    .as_ref()
                    .ok_or(TlsError::NotConfigured("cert"))?;
                Ok(Some(Box::new(context.client_session(host)?)))
            }
            TlsMode::Psk => {
                let (credentials, backend) = self.psk_parts()?;
                Ok(Some(backend.client_session(credentials)?))
            }
        }
    }

    /// Session for an incoming TLS connection, picked from the accepted modes
    ///
    /// When both certificate and PSK mode are possible, the peer's
    /// ClientHello decides: PSK if it offers a PSK cipher suite. A hello
    /// that cannot be parsed falls back to certificate mode.
    pub fn server_session(
        &self,
        accept: &[TlsMode],
        client_hello: &[u8],
    ) -> Result<(Box<dyn TlsSession>, TlsMode), TlsError> {
        let mode = accept_mode(
            accept,
            self.certificate.is_some(),
            self.psk.is_some(),
            client_hello,
        )?;

        let session = match (mode, &self.certificate) {
            (TlsMode::Cert, Some(context)) => Box::new(context.server_session()?) as Box<dyn TlsSession>,
            _ => {
                let (credentials, backend) = self.psk_parts()?;
                backend.server_session(credentials)?
            }
        };
        Ok((session, mode))
    }
}

fn accept_mode(
    accept: &[TlsMode],
    have_cert: bool,
    have_psk: bool,
    client_hello: &[u8],
) -> Result<TlsMode, TlsError> {
    let cert_allowed = accept.contains(&TlsMode::Cert);
    let psk_allowed = accept.contains(&TlsMode::Psk);
    if !cert_allowed && !psk_allowed {
        return Err(TlsError::NotAllowed("TLS"));
    }

    match (cert_allowed && have_cert, psk_allowed && have_psk) {
        (true, true) => {
            if client_hello_offers_psk(client_hello).unwrap_or(false) {
                Ok(TlsMode::Psk)
            } else {
                Ok(TlsMode::Cert)
            }
        }
        (true, false) => Ok(TlsMode::Cert),
        (false, true) => Ok(TlsMode::Psk),
        (false, false) if cert_allowed => Err(TlsError::NotConfigured("cert")),
        (false, false) => Err(TlsError::NotConfigured("psk")),
    }
}

/// Whether a ClientHello offers at least one PSK cipher suite
///
/// `None` when `hello` does not hold a ClientHello record up to the end of
/// its cipher suite list.
pub fn client_hello_offers_psk(hello: &[u8]) -> Option<bool> {
    if *hello.first()? != TLS_HANDSHAKE_RECORD || *hello.get(5)? != CLIENT_HELLO {
        return None;
    }

    // record header, handshake header, client version, random
    let mut pos = 5 + 4 + 2 + 32;
    let session_id_len = usize::from(*hello.get(pos)?);
    pos += 1 + session_id_len;

    let suites_len = usize::from(u16::from_be_bytes([*hello.get(pos)?, *hello.get(pos + 1)?]));
    pos += 2;
    let suites = hello.get(pos..pos + suites_len)?;

    Some(
        suites
            .chunks_exact(2)
            .map(|suite| u16::from_be_bytes([suite[0], suite[1]]))
            .any(is_psk_suite),
    )
}

fn is_psk_suite(suite: u16) -> bool {
    matches!(
        suite,
        0x002C..=0x002E
            | 0x008A..=0x0095
            | 0x00A8..=0x00B9
            | 0xC033..=0xC03B
            | 0xC064..=0xC06B
            | 0xC08E..=0xC095
            | 0xC0A4..=0xC0AB
            | 0xCCAB..=0xCCAE
            | 0xD001..=0xD005
    )
}

/// PSK implementation compiled into this build, if any
#[cfg(feature = "tls-psk")]
pub fn default_psk_backend() -> Option<Arc<dyn PskBackend>> {
    Some(Arc::new(super::psk::OpensslPsk))
}

#[cfg(not(feature = "tls-psk"))]
pub fn default_psk_backend() -> Option<Arc<dyn PskBackend>> {
    None
}

impl fmt::Debug for TlsContexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContexts")
            .field("certificate", &self.certificate.is_some())
            .field("psk", &self.psk)
            .field("psk_backend", &self.psk_backend.is_some())
            .finish()
    }
}

/// Process-wide TLS contexts with atomic replacement
#[derive(Debug, Default)]
pub struct TlsRegistry {
    current: RwLock<Arc<TlsContexts>>,
}

impl TlsRegistry {
    pub fn new(contexts: TlsContexts) -> Self {
        Self {
            current: RwLock::new(Arc::new(contexts)),
        }
    }

    pub fn reload(&self, contexts: TlsContexts) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(contexts);
    }

    pub fn snapshot(&self) -> Arc<TlsContexts> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
