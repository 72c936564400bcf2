//! One framed exchange over TCP, optionally wrapped in TLS
//!
//! A [`Connection`] lives for a single request/response and is dropped
//! afterwards. Every socket operation runs under a deadline that is either
//! fixed for the whole connection or restarted for each operation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use super::error::{TlsError, TransportError};
use super::frame::{self, Header, MAGIC, PREFIX_LEN};
use super::tls::{TLS_HANDSHAKE_RECORD, TlsChannel, TlsMode, TlsRegistry};
use crate::address::Address;

const CLIENT_HELLO_PEEK: usize = 2048;

/// How long socket operations may take
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Everything must finish before this instant
    Fixed(Instant),
    /// Each read or write gets the full duration
    PerOperation(Duration),
}

impl Deadline {
    pub fn fixed(duration: Duration) -> Self {
        Deadline::Fixed(Instant::now() + duration)
    }

    fn remaining(&self) -> Duration {
        match self {
            Deadline::Fixed(at) => at.saturating_duration_since(Instant::now()),
            Deadline::PerOperation(duration) => *duration,
        }
    }
}

/// Settings for outgoing connections
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub tls_mode: TlsMode,
    pub contexts: Arc<TlsRegistry>,
    pub compress: bool,
    pub max_message_size: u64,
}

impl ConnectOptions {
    pub fn plain(timeout: Duration) -> Self {
        Self {
            timeout,
            tls_mode: TlsMode::Unencrypted,
            contexts: Arc::new(TlsRegistry::default()),
            compress: true,
            max_message_size: frame::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Settings for accepted connections
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    pub timeout: Duration,
    pub accept: Vec<TlsMode>,
    pub contexts: Arc<TlsRegistry>,
    pub max_message_size: u64,
}

impl AcceptOptions {
    pub fn plain(timeout: Duration) -> Self {
        Self {
            timeout,
            accept: vec![TlsMode::Unencrypted],
            contexts: Arc::new(TlsRegistry::default()),
            max_message_size: frame::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A request read by the passive listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub payload: Vec<u8>,
    /// Arrived with a protocol header (as opposed to a bare line of text)
    pub framed: bool,
    pub compressed: bool,
}

enum Channel<S> {
    Plain(S),
    Tls(Box<TlsChannel<S>>),
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            Channel::Plain(stream) => Ok(stream.read(buf).await?),
            Channel::Tls(channel) => Ok(channel.read(buf).await?),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            Channel::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Channel::Tls(channel) => channel.write_all(data).await?,
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self {
            Channel::Plain(stream) => stream.shutdown().await?,
            Channel::Tls(channel) => channel.close().await?,
        }
        Ok(())
    }
}

pub struct Connection<S = TcpStream> {
    channel: Channel<S>,
    deadline: Deadline,
    compress: bool,
    max_message_size: u64,
    peer: Option<SocketAddr>,
    tls: TlsMode,
}

impl Connection<TcpStream> {
    /// Open a connection, performing the TLS handshake when configured
    #[instrument(skip(options), fields(tls = %options.tls_mode))]
    pub async fn connect(address: &Address, options: &ConnectOptions) -> Result<Self, TransportError> {
        let stream = timeout(
            options.timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "connect",
        })??;
        let peer = stream.peer_addr().ok();
        trace!("connected to {:?}", peer);

        let session = options
            .contexts
            .snapshot()
            .client_session(options.tls_mode, &address.host)?;

        let channel = match session {
            None => Channel::Plain(stream),
            Some(session) => {
                let mut tls = Box::new(TlsChannel::new(stream, session));
                timeout(options.timeout, tls.handshake())
                    .await
                    .map_err(|_| TransportError::Timeout {
                        operation: "TLS handshake",
                    })??;
                Channel::Tls(tls)
            }
        };

        Ok(Self {
            channel,
            deadline: Deadline::PerOperation(options.timeout),
            compress: options.compress,
            max_message_size: options.max_message_size,
            peer,
            tls: options.tls_mode,
        })
    }

    /// Take over an accepted socket
    ///
    /// The first byte decides between cleartext and a TLS handshake; the
    /// whole exchange then has to finish within the timeout.
    pub async fn accept(stream: TcpStream, options: &AcceptOptions) -> Result<Self, TransportError> {
        let deadline = Deadline::fixed(options.timeout);
        let peer = stream.peer_addr().ok();

        let mut first = [0u8; 1];
        let peeked = timeout(deadline.remaining(), stream.peek(&mut first))
            .await
            .map_err(|_| TransportError::Timeout { operation: "read" })??;
        if peeked == 0 {
            return Err(TransportError::ConnectionClosed);
        }

        let (channel, tls) = if first[0] == TLS_HANDSHAKE_RECORD {
            // the ClientHello is already buffered once its first byte is
            let mut hello = vec![0u8; CLIENT_HELLO_PEEK];
            let peeked = stream.peek(&mut hello).await?;
            hello.truncate(peeked);

            let (session, mode) = options
                .contexts
                .snapshot()
                .server_session(&options.accept, &hello)?;
            let mut channel = Box::new(TlsChannel::new(stream, session));
            timeout(deadline.remaining(), channel.handshake())
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "TLS handshake",
                })??;
            (Channel::Tls(channel), mode)
        } else {
            if !options.accept.contains(&TlsMode::Unencrypted) {
                return Err(TlsError::NotAllowed("unencrypted").into());
            }
            (Channel::Plain(stream), TlsMode::Unencrypted)
        };

        debug!("accepted {} connection from {:?}", tls, peer);

        Ok(Self {
            channel,
            deadline,
            compress: false,
            max_message_size: options.max_message_size,
            peer,
            tls,
        })
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already established cleartext stream
    pub fn from_stream(stream: S, per_operation: Duration) -> Self {
        Self {
            channel: Channel::Plain(stream),
            deadline: Deadline::PerOperation(per_operation),
            compress: true,
            max_message_size: frame::DEFAULT_MAX_MESSAGE_SIZE,
            peer: None,
            tls: TlsMode::Unencrypted,
        }
    }

    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn set_compression(&mut self, compress: bool) {
        self.compress = compress;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        timeout(self.deadline.remaining(), self.channel.read(buf))
            .await
            .map_err(|_| TransportError::Timeout { operation: "read" })?
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Read the rest of a framed message after its prefix
    async fn read_framed(&mut self, prefix: [u8; PREFIX_LEN]) -> Result<(Header, Vec<u8>), TransportError> {
        let flags = Header::parse_prefix(&prefix)?;

        let mut lengths = [0u8; 16];
        let lengths = &mut lengths[..Header::lengths_size(flags)];
        self.read_exact(lengths).await?;
        let header = Header::parse_lengths(flags, lengths, self.max_message_size)?;

        let mut body = vec![0u8; header.data_len as usize];
        self.read_exact(&mut body).await?;
        trace!(
            "received {} bytes (compressed: {})",
            header.data_len,
            header.is_compressed()
        );

        let payload = frame::decode_body(&header, body)?;
        Ok((header, payload))
    }

    /// Send one framed message
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let message = frame::encode(payload, self.compress)?;
        trace!("sending {} bytes ({} on the wire)", payload.len(), message.len());
        timeout(self.deadline.remaining(), self.channel.write_all(&message))
            .await
            .map_err(|_| TransportError::Timeout { operation: "write" })?
    }

    /// Send raw bytes without a header
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        timeout(self.deadline.remaining(), self.channel.write_all(data))
            .await
            .map_err(|_| TransportError::Timeout { operation: "write" })?
    }

    /// Receive one framed message
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut prefix = [0u8; PREFIX_LEN];
        self.read_exact(&mut prefix).await?;
        let (_, payload) = self.read_framed(prefix).await?;
        Ok(payload)
    }

    /// Receive a passive request: framed, or a bare line terminated by
    /// newline or end of stream
    pub async fn recv_request(&mut self) -> Result<Request, TransportError> {
        let mut start = Vec::with_capacity(PREFIX_LEN);
        let mut byte = [0u8; 1];

        while start.len() < PREFIX_LEN && MAGIC.starts_with(&start[..start.len().min(MAGIC.len())]) {
            if self.read_some(&mut byte).await? == 0 {
                break;
            }
            start.push(byte[0]);
            if start.len() == PREFIX_LEN || byte[0] == b'\n' {
                break;
            }
        }

        if start.len() == PREFIX_LEN && start[..MAGIC.len()] == MAGIC {
            let mut prefix = [0u8; PREFIX_LEN];
            prefix.copy_from_slice(&start);
            let (header, payload) = self.read_framed(prefix).await?;
            return Ok(Request {
                payload,
                framed: true,
                compressed: header.is_compressed(),
            });
        }

        let mut payload = start;
        while !payload.ends_with(b"\n") {
            if payload.len() as u64 > self.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    size: payload.len() as u64,
                    max: self.max_message_size,
                });
            }
            if self.read_some(&mut byte).await? == 0 {
                break;
            }
            payload.push(byte[0]);
        }

        while matches!(payload.last(), Some(b'\n' | b'\r')) {
            payload.pop();
        }

        Ok(Request {
            payload,
            framed: false,
            compressed: false,
        })
    }

    /// Send a request and wait for the response
    pub async fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send(payload).await?;
        self.recv().await
    }

    pub async fn close(mut self) {
        if let Err(e) = self.channel.shutdown().await {
            trace!("error while closing connection: {}", e);
        }
    }
}

/// Connect, send one request, read the response, close
#[instrument(skip_all, fields(address = %address))]
pub async fn exchange(
    address: &Address,
    payload: &[u8],
    options: &ConnectOptions,
) -> Result<Vec<u8>, TransportError> {
    let mut connection = Connection::connect(address, options).await?;
    let response = connection.exchange(payload).await;
    connection.close().await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::duplex;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_send_and_recv_across_partial_reads() {
        // a tiny pipe forces many partial reads
        let (a, b) = duplex(7);
        let mut sender = Connection::from_stream(a, TIMEOUT);
        let mut receiver = Connection::from_stream(b, TIMEOUT);

        let payload = vec![b'z'; 10_000];
        let expected = payload.clone();
        let send = tokio::spawn(async move { sender.send(&payload).await });

        assert_eq!(receiver.recv().await.unwrap(), expected);
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_uncompressed_exchange() {
        let (a, b) = duplex(4096);
        let mut client = Connection::from_stream(a, TIMEOUT);
        client.set_compression(false);
        let mut server = Connection::from_stream(b, TIMEOUT);

        let server = tokio::spawn(async move {
            let request = server.recv_request().await.unwrap();
            assert!(request.framed);
            assert!(!request.compressed);
            server.set_compression(request.compressed);
            server.send(b"pong").await.unwrap();
            request.payload
        });

        assert_eq!(client.exchange(b"ping").await.unwrap(), b"pong");
        assert_eq!(server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_legacy_request_line() {
        let (mut a, b) = duplex(4096);
        let mut server = Connection::from_stream(b, TIMEOUT);

        a.write_all(b"agent.ping\n").await.unwrap();
        let request = server.recv_request().await.unwrap();
        assert!(!request.framed);
        assert_eq!(request.payload, b"agent.ping");
    }

    #[tokio::test]
    async fn test_legacy_request_until_eof() {
        let (mut a, b) = duplex(4096);
        let mut server = Connection::from_stream(b, TIMEOUT);

        a.write_all(b"ZB").await.unwrap();
        drop(a);
        let request = server.recv_request().await.unwrap();
        assert_eq!(request.payload, b"ZB");
    }

    #[tokio::test]
    async fn test_early_close_is_an_error() {
        let (mut a, b) = duplex(4096);
        let mut receiver = Connection::from_stream(b, TIMEOUT);

        let message = frame::encode(b"truncated payload", false).unwrap();
        a.write_all(&message[..message.len() - 3]).await.unwrap();
        drop(a);

        assert_matches!(receiver.recv().await, Err(TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversize_message_rejected() {
        let (mut a, b) = duplex(4096);
        let mut receiver = Connection::from_stream(b, TIMEOUT).with_max_message_size(16);

        let message = frame::encode(&[1u8; 64], false).unwrap();
        a.write_all(&message[..13]).await.unwrap();

        assert_matches!(
            receiver.recv().await,
            Err(TransportError::MessageTooLarge { size: 64, max: 16 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (_a, b) = duplex(64);
        let mut receiver = Connection::from_stream(b, Duration::from_secs(3));
        assert_matches!(
            receiver.recv().await,
            Err(TransportError::Timeout { operation: "read" })
        );
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::accept(stream, &AcceptOptions::plain(TIMEOUT))
                .await
                .unwrap();
            let request = conn.recv_request().await.unwrap();
            conn.set_compression(request.compressed);
            conn.send(&request.payload).await.unwrap();
            request.compressed
        });

        let address = Address::new("127.0.0.1", port);
        let response = exchange(&address, b"echo", &ConnectOptions::plain(TIMEOUT))
            .await
            .unwrap();
        assert_eq!(response, b"echo");
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_unencrypted_refused_when_not_accepted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let options = AcceptOptions {
                accept: vec![TlsMode::Cert],
                ..AcceptOptions::plain(TIMEOUT)
            };
            Connection::accept(stream, &options).await.map(|_| ())
        });

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"agent.ping\n").await.unwrap();

        assert_matches!(
            server.await.unwrap(),
            Err(TransportError::Tls(TlsError::NotAllowed("unencrypted")))
        );
    }

    #[cfg(feature = "tls-psk")]
    #[tokio::test]
    async fn test_psk_exchange_over_tcp() {
        use crate::protocol::psk::OpensslPsk;
        use crate::protocol::tls::{PskCredentials, TlsContexts};

        const KEY: &str = "1f87b595725ac58dd977beef14b97461a7c1045b9a1c963065002c5473194952";
        let registry = || {
            Arc::new(TlsRegistry::new(TlsContexts {
                certificate: None,
                psk: Some(Arc::new(PskCredentials::new("agent", KEY).unwrap())),
                psk_backend: Some(Arc::new(OpensslPsk)),
            }))
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = AcceptOptions {
            accept: vec![TlsMode::Psk],
            contexts: registry(),
            ..AcceptOptions::plain(TIMEOUT)
        };
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::accept(stream, &accept).await.unwrap();
            let mode = conn.tls_mode();
            let request = conn.recv_request().await.unwrap();
            conn.send(&request.payload).await.unwrap();
            conn.close().await;
            mode
        });

        let connect = ConnectOptions {
            tls_mode: TlsMode::Psk,
            contexts: registry(),
            ..ConnectOptions::plain(TIMEOUT)
        };
        let response = exchange(&Address::new("127.0.0.1", port), b"agent.ping", &connect)
            .await
            .unwrap();

        assert_eq!(response, b"agent.ping");
        assert_eq!(server.await.unwrap(), TlsMode::Psk);
    }
}
