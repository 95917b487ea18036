use crate::cli::Args;
use crate::deflate::{ self, DeflateCodec, EXTENSION_NAME };
use crate::error::{ ChatError, Result };
use async_trait::async_trait;
use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use log::{ debug, info, trace, warn };
use std::io::{ Cursor, ErrorKind };
use std::sync::Arc;
use tokio::io::{ AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt };
use tokio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ ClientConfig, RootCertStore };
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{ ProtocolError, UrlError };
use tokio_tungstenite::tungstenite::handshake::client::{ generate_request, Request, Response };
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::handshake::machine::TryParse;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName,
    HeaderValue,
    CONNECTION,
    ORIGIN,
    SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION,
    UPGRADE,
    USER_AGENT,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{ Control, Data, OpCode };
use tokio_tungstenite::tungstenite::protocol::frame::{ Frame, FrameHeader };
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::MaybeTlsStream;
use url::{ Host, Url };
use uuid::Uuid;

const WEBSOCKET_VERSION: &str = "13";
const MAX_MESSAGE_SIZE: usize = 64 << 20;
const MAX_HANDSHAKE_SIZE: usize = 64 << 10;
const MAX_CONTROL_PAYLOAD: usize = 125;
const READ_CHUNK: usize = 8192;

/// One open duplex connection carrying UTF-8 text messages.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text payload, or `None` once the peer has closed the connection.
    async fn recv_text(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Per-connection `Sec-WebSocket-Key` and the accept value the server must answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeKey {
    pub key: String,
    pub expected_accept: String,
}

impl HandshakeKey {
    pub fn generate() -> Self {
        Self::from_nonce(Uuid::new_v4().as_bytes())
    }

    pub fn from_nonce(nonce: &[u8; 16]) -> Self {
        Self::from_key(STANDARD.encode(nonce))
    }

    pub fn from_key(key: String) -> Self {
        let expected_accept = derive_accept_key(key.as_bytes());
        Self { key, expected_accept }
    }

    pub fn verify(&self, response: &Response) -> Result<()> {
        let actual = response
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if actual == self.expected_accept {
            Ok(())
        } else {
            Err(ChatError::AcceptMismatch {
                expected: self.expected_accept.clone(),
                actual: actual.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    origin: String,
    user_agent: String,
    deflate: bool,
}

impl WsConnector {
    pub fn new(url: Url, origin: String, user_agent: String, deflate: bool) -> Self {
        Self { url, origin, user_agent, deflate }
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let url = args.endpoint()?;
        Ok(Self::new(url, args.origin.clone(), args.user_agent.clone(), !args.no_deflate))
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn build_request(&self, key: &HandshakeKey) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request().map_err(|e| ChatError::InvalidUrl {
            url: self.url.to_string(),
            reason: e.to_string(),
        })?;

        let headers = request.headers_mut();
        headers.insert(USER_AGENT, header_value("User-Agent", &self.user_agent)?);
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WEBSOCKET_VERSION));
        headers.insert(ORIGIN, header_value("Origin", &self.origin)?);
        if self.deflate {
            headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static(EXTENSION_NAME));
        }
        headers.insert(SEC_WEBSOCKET_KEY, header_value("Sec-WebSocket-Key", &key.key)?);
        Ok(request)
    }

    async fn open_stream(&self) -> std::result::Result<MaybeTlsStream<TcpStream>, tungstenite::Error> {
        let host = match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(tungstenite::Error::Url(UrlError::NoHostName));
            }
        };
        let port = self.url
            .port_or_known_default()
            .ok_or(tungstenite::Error::Url(UrlError::UnsupportedUrlScheme))?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        if self.url.scheme() != "wss" {
            return Ok(MaybeTlsStream::Plain(tcp));
        }
        let domain = ServerName::try_from(host.clone()).map_err(|_|
            tungstenite::Error::Url(UrlError::UnableToConnect(host.clone()))
        )?;
        let tls = tls_connector()?.connect(domain, tcp).await?;
        debug!("TLS session established with {}", host);
        Ok(MaybeTlsStream::Rustls(tls))
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ChatError::InvalidHeader {
        name,
        reason: e.to_string(),
    })
}

fn tls_connector() -> std::result::Result<TlsConnector, tungstenite::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tungstenite::Error::Io(std::io::Error::new(ErrorKind::Other, e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let key = HandshakeKey::generate();
        let request = self.build_request(&key)?;
        debug!("Opening WebSocket connection to {} (key {})", self.url, key.key);

        let stream = self.open_stream().await.map_err(|source| ChatError::Connect {
            url: self.url.to_string(),
            source,
        })?;
        let connection = WsConnection::handshake(stream, request, &key, self.deflate).await?;
        info!(
            "Connected to {} (permessage-deflate {})",
            self.url,
            if connection.deflate.is_some() { "on" } else { "off" }
        );

        Ok(Box::new(connection))
    }
}

/// Client side of an upgraded WebSocket stream. Frames are parsed and built
/// with tungstenite's frame types; permessage-deflate payloads go through
/// [`DeflateCodec`].
pub struct WsConnection<S> {
    stream: S,
    buffer: Vec<u8>,
    deflate: Option<DeflateCodec>,
    max_message_size: usize,
    closed: bool,
}

impl<S> WsConnection<S> where S: AsyncRead + AsyncWrite + Unpin + Send {
    /// Performs the opening handshake on an already connected stream.
    pub async fn handshake(
        mut stream: S,
        request: Request,
        key: &HandshakeKey,
        offered_deflate: bool
    ) -> Result<Self> {
        let (raw_request, _) = generate_request(request)?;
        stream.write_all(&raw_request).await.map_err(tungstenite::Error::Io)?;
        stream.flush().await.map_err(tungstenite::Error::Io)?;

        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let response = loop {
            if let Some((used, response)) = Response::try_parse(&buffer)? {
                buffer.drain(..used);
                break response;
            }
            if buffer.len() > MAX_HANDSHAKE_SIZE {
                return Err(tungstenite::Error::Protocol(ProtocolError::HandshakeIncomplete).into());
            }
            if fill(&mut stream, &mut buffer).await? == 0 {
                return Err(tungstenite::Error::Protocol(ProtocolError::HandshakeIncomplete).into());
            }
        };
        trace!("Handshake response: {:?}", response);

        let response = check_upgrade(response)?;
        key.verify(&response)?;
        let extensions = response
            .headers()
            .get(SEC_WEBSOCKET_EXTENSIONS)
            .map(|v| v.to_str())
            .transpose()
            .map_err(|e| ChatError::Extension(e.to_string()))?;
        let deflate = deflate::negotiate(extensions, offered_deflate)?;
        if let Some(params) = &deflate {
            debug!("Server accepted permessage-deflate: {:?}", params);
        }

        Ok(Self {
            stream,
            buffer,
            deflate: deflate.map(DeflateCodec::new),
            max_message_size: MAX_MESSAGE_SIZE,
            closed: false,
        })
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn deflate_enabled(&self) -> bool {
        self.deflate.is_some()
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let parsed = {
                let mut cursor = Cursor::new(&self.buffer[..]);
                FrameHeader::parse(&mut cursor)?.map(|(header, length)| (header, length, cursor.position() as usize))
            };
            if let Some((header, length, offset)) = parsed {
                let length = usize::try_from(length).unwrap_or(usize::MAX);
                if length > self.max_message_size {
                    return Err(ChatError::MessageTooLarge { size: length, max_size: self.max_message_size });
                }
                if self.buffer.len() >= offset + length {
                    let payload = self.buffer[offset..offset + length].to_vec();
                    self.buffer.drain(..offset + length);
                    return Ok(Some(Frame::from_payload(header, payload)));
                }
            }
            if fill(&mut self.stream, &mut self.buffer).await? == 0 {
                if !self.buffer.is_empty() {
                    debug!("Connection dropped with {} bytes of a partial frame", self.buffer.len());
                }
                return Ok(None);
            }
        }
    }

    async fn write_frame(&mut self, mut frame: Frame) -> Result<()> {
        frame.header_mut().mask = Some(rand::random());
        let mut out = Vec::with_capacity(frame.len());
        frame.format(&mut out)?;
        self.stream.write_all(&out).await.map_err(tungstenite::Error::Io)?;
        self.stream.flush().await.map_err(tungstenite::Error::Io)?;
        Ok(())
    }

    fn finish_message(&mut self, compressed: bool, payload: Vec<u8>) -> Result<String> {
        let payload = match (&mut self.deflate, compressed) {
            (Some(codec), true) => codec.inflate(&payload, self.max_message_size)?,
            _ => payload,
        };
        Ok(String::from_utf8(payload)?)
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut Vec<u8>) -> Result<usize> {
    buffer.reserve(READ_CHUNK);
    let read = stream.read_buf(buffer).await.map_err(tungstenite::Error::Io)?;
    Ok(read)
}

fn check_upgrade(response: Response) -> Result<Response> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(tungstenite::Error::Http(response).into());
    }
    let header_is = |name: HeaderName, expected: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(expected)))
    };
    if !header_is(UPGRADE, "websocket") {
        return Err(tungstenite::Error::Protocol(ProtocolError::MissingUpgradeWebSocketHeader).into());
    }
    if !header_is(CONNECTION, "upgrade") {
        return Err(tungstenite::Error::Protocol(ProtocolError::MissingConnectionUpgradeHeader).into());
    }
    Ok(response)
}

fn protocol(error: ProtocolError) -> ChatError {
    ChatError::Transport(tungstenite::Error::Protocol(error))
}

fn is_disconnect(error: &ChatError) -> bool {
    match error {
        ChatError::Transport(tungstenite::Error::Io(e)) =>
            matches!(
                e.kind(),
                ErrorKind::BrokenPipe |
                    ErrorKind::ConnectionReset |
                    ErrorKind::ConnectionAborted |
                    ErrorKind::NotConnected
            ),
        _ => false,
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S> where S: AsyncRead + AsyncWrite + Unpin + Send {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(tungstenite::Error::AlreadyClosed.into());
        }
        let mut payload = text.into_bytes();
        let mut compressed = false;
        if let Some(codec) = self.deflate.as_mut().filter(|c| c.compresses_outbound()) {
            payload = codec.deflate(&payload)?;
            compressed = true;
        }

        let mut frame = Frame::message(payload, OpCode::Data(Data::Text), true);
        frame.header_mut().rsv1 = compressed;
        self.write_frame(frame).await
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }

        // (compressed, payload so far) of a fragmented message
        let mut partial: Option<(bool, Vec<u8>)> = None;
        loop {
            let frame = match self.read_frame().await? {
                Some(frame) => frame,
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            };
            let (is_final, rsv1, opcode) = {
                let header = frame.header();
                if header.mask.is_some() {
                    return Err(protocol(ProtocolError::MaskedFrameFromServer));
                }
                if header.rsv2 || header.rsv3 {
                    return Err(protocol(ProtocolError::NonZeroReservedBits));
                }
                (header.is_final, header.rsv1, header.opcode)
            };

            match opcode {
                OpCode::Control(control) => {
                    if !is_final {
                        return Err(protocol(ProtocolError::FragmentedControlFrame));
                    }
                    if frame.payload().len() > MAX_CONTROL_PAYLOAD {
                        return Err(protocol(ProtocolError::ControlFrameTooBig));
                    }
                    if rsv1 {
                        return Err(protocol(ProtocolError::NonZeroReservedBits));
                    }
                    match control {
                        Control::Ping => {
                            trace!("Answering ping");
                            self.write_frame(Frame::pong(frame.into_data())).await?;
                        }
                        Control::Pong => {}
                        Control::Close => {
                            let payload = frame.into_data();
                            debug!("Received close frame ({} bytes)", payload.len());
                            let code = payload.get(..2).map(<[u8]>::to_vec).unwrap_or_default();
                            let reply = Frame::from_payload(
                                FrameHeader { opcode: OpCode::Control(Control::Close), ..FrameHeader::default() },
                                code
                            );
                            if let Err(e) = self.write_frame(reply).await {
                                debug!("Could not answer close frame: {}", e);
                            }
                            self.closed = true;
                            return Ok(None);
                        }
                        Control::Reserved(op) => {
                            return Err(protocol(ProtocolError::UnknownControlFrameType(op)));
                        }
                    }
                }
                OpCode::Data(Data::Continue) => {
                    if rsv1 {
                        return Err(protocol(ProtocolError::NonZeroReservedBits));
                    }
                    let (compressed, mut payload) = partial
                        .take()
                        .ok_or_else(|| protocol(ProtocolError::UnexpectedContinueFrame))?;
                    let size = payload.len() + frame.payload().len();
                    if size > self.max_message_size {
                        return Err(ChatError::MessageTooLarge { size, max_size: self.max_message_size });
                    }
                    payload.extend_from_slice(frame.payload());
                    if is_final {
                        return self.finish_message(compressed, payload).map(Some);
                    }
                    partial = Some((compressed, payload));
                }
                OpCode::Data(data @ (Data::Text | Data::Binary)) => {
                    if partial.is_some() {
                        return Err(protocol(ProtocolError::ExpectedFragment(data)));
                    }
                    if rsv1 && self.deflate.is_none() {
                        return Err(protocol(ProtocolError::NonZeroReservedBits));
                    }
                    let payload = frame.into_data();
                    if is_final {
                        return self.finish_message(rsv1, payload).map(Some);
                    }
                    partial = Some((rsv1, payload));
                }
                OpCode::Data(Data::Reserved(op)) => {
                    return Err(protocol(ProtocolError::UnknownDataFrameType(op)));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.write_frame(Frame::close(None)).await {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {
                debug!("Peer already gone while closing: {}", e);
                return Ok(());
            }
            Err(e) => {
                warn!("Error while closing WebSocket connection: {}", e);
                return Err(e);
            }
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown after close frame failed: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_response;
    use crate::deflate::tests::server_deflate;
    use crate::deflate::DeflateParams;
    use crate::models::chat::Turn;
    use crate::models::websocket::ChatRequest;
    use futures::{ SinkExt, StreamExt };
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::http;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn connector(deflate: bool) -> WsConnector {
        WsConnector::new(
            Url::parse("wss://api.shako.ai/api/chat").unwrap(),
            "https://shako.ai".to_string(),
            "test-agent".to_string(),
            deflate
        )
    }

    fn local_connector(port: u16, deflate: bool) -> WsConnector {
        WsConnector::new(
            Url::parse(&format!("ws://127.0.0.1:{}/api/chat", port)).unwrap(),
            "https://shako.ai".to_string(),
            "test-agent".to_string(),
            deflate
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new("chat-1".to_string(), vec![Turn::user("hi")])
    }

    /// Unmasked server frame bytes.
    fn server_frame(opcode: OpCode, payload: Vec<u8>, is_final: bool, rsv1: bool) -> Vec<u8> {
        let header = FrameHeader { is_final, rsv1, opcode, ..FrameHeader::default() };
        let mut out = Vec::new();
        Frame::from_payload(header, payload).format(&mut out).unwrap();
        out
    }

    fn text_frame(text: &str) -> Vec<u8> {
        server_frame(OpCode::Data(Data::Text), text.as_bytes().to_vec(), true, false)
    }

    async fn read_upgrade_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        while !raw.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            assert_eq!(socket.read(&mut byte).await.unwrap(), 1);
            raw.push(byte[0]);
        }
        String::from_utf8(raw).unwrap()
    }

    /// Reads the upgrade request off `socket` and answers 101, optionally accepting an extension.
    async fn answer_upgrade(socket: &mut TcpStream, extensions: Option<&str>) -> String {
        let request = read_upgrade_request(socket).await;
        let key = request
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .trim()
            .to_string();
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
            derive_accept_key(key.as_bytes())
        );
        if let Some(ext) = extensions {
            response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", ext));
        }
        response.push_str("\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        request
    }

    /// Reads one masked client frame and returns its header and unmasked payload.
    async fn read_client_frame(socket: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
        let mut buf = Vec::new();
        loop {
            let mut cursor = Cursor::new(&buf[..]);
            if let Some((header, len)) = FrameHeader::parse(&mut cursor).unwrap() {
                let offset = cursor.position() as usize;
                if buf.len() >= offset + (len as usize) {
                    let mask = header.mask.expect("client frames are masked");
                    let payload = buf[offset..offset + (len as usize)]
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ mask[i % 4])
                        .collect();
                    return (header, payload);
                }
            }
            let mut chunk = [0u8; 1024];
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up mid-frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn raw_server<F, Fut>(script: F) -> (u16, JoinHandle<()>)
        where F: FnOnce(TcpStream) -> Fut + Send + 'static, Fut: std::future::Future<Output = ()> + Send + 'static
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            script(socket).await;
        });
        (port, handle)
    }

    #[test]
    fn accept_key_follows_rfc6455() {
        let key = HandshakeKey::from_key("dGhlIHNhbXBsZSBub25jZQ==".to_string());
        assert_eq!(key.expected_accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn generated_keys_are_fresh_16_byte_nonces() {
        let a = HandshakeKey::generate();
        let b = HandshakeKey::generate();
        assert_ne!(a.key, b.key);
        assert_eq!(STANDARD.decode(&a.key).unwrap().len(), 16);
    }

    #[test]
    fn request_carries_identifying_headers() {
        let key = HandshakeKey::from_nonce(&[7u8; 16]);
        let request = connector(true).build_request(&key).unwrap();
        let headers = request.headers();

        assert_eq!(request.uri().to_string(), "wss://api.shako.ai/api/chat");
        assert_eq!(headers[USER_AGENT], "test-agent");
        assert_eq!(headers[ORIGIN], "https://shako.ai");
        assert_eq!(headers[SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(headers[SEC_WEBSOCKET_EXTENSIONS], "permessage-deflate");
        assert_eq!(headers[SEC_WEBSOCKET_KEY], key.key.as_str());
        assert_eq!(headers.get_all(SEC_WEBSOCKET_KEY).iter().count(), 1);
    }

    #[test]
    fn deflate_header_can_be_disabled() {
        let key = HandshakeKey::generate();
        let request = connector(false).build_request(&key).unwrap();
        assert!(request.headers().get(SEC_WEBSOCKET_EXTENSIONS).is_none());
    }

    #[test]
    fn verify_rejects_wrong_accept() {
        let key = HandshakeKey::generate();
        let good = http::Response::builder()
            .status(101)
            .header(SEC_WEBSOCKET_ACCEPT, key.expected_accept.as_str())
            .body(None)
            .unwrap();
        assert!(key.verify(&good).is_ok());

        let bad = http::Response::builder()
            .status(101)
            .header(SEC_WEBSOCKET_ACCEPT, "bogus")
            .body(None)
            .unwrap();
        assert!(matches!(key.verify(&bad), Err(ChatError::AcceptMismatch { .. })));
    }

    #[tokio::test]
    async fn inflates_compressed_end_frame() {
        let (port, server) = raw_server(|mut socket| async move {
            let request = answer_upgrade(&mut socket, Some("permessage-deflate")).await;
            assert!(request.contains("Sec-WebSocket-Extensions: permessage-deflate") ||
                request.contains("sec-websocket-extensions: permessage-deflate"));

            let (header, payload) = read_client_frame(&mut socket).await;
            assert!(header.rsv1, "outbound message should be compressed once negotiated");
            let mut codec = DeflateCodec::new(DeflateParams::default());
            let body = codec.inflate(&payload, 1 << 20).unwrap();
            let sent: ChatRequest = serde_json::from_slice(&body).unwrap();
            assert_eq!(sent.chat_id, "chat-1");

            let compressed = server_deflate(br#"{"type":"end","chat_id":"X"}"#);
            let frame = server_frame(OpCode::Data(Data::Text), compressed, true, true);
            socket.write_all(&frame).await.unwrap();
        }).await;

        let mut connection = local_connector(port, true).connect().await.unwrap();
        let reply = assemble_response(connection.as_mut(), &request()).await.unwrap();
        assert_eq!(reply.text, "");
        assert_eq!(reply.chat_id.as_deref(), Some("X"));
        connection.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn inflate_context_spans_messages() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, Some("permessage-deflate; client_max_window_bits=10")).await;
            let (header, _) = read_client_frame(&mut socket).await;
            assert!(!header.rsv1, "narrowed client window disables outbound compression");

            let mut codec = DeflateCodec::new(DeflateParams::default());
            for text in [r#"{"content":"Hello, "}"#, r#"{"content":"Hello again"}"#, r#"{"type":"end"}"#] {
                let compressed = codec.deflate(text.as_bytes()).unwrap();
                // split the compressed message over two fragments
                let (head, tail) = compressed.split_at(compressed.len() / 2);
                socket
                    .write_all(&server_frame(OpCode::Data(Data::Text), head.to_vec(), false, true)).await
                    .unwrap();
                socket
                    .write_all(&server_frame(OpCode::Data(Data::Continue), tail.to_vec(), true, false)).await
                    .unwrap();
            }
        }).await;

        let mut connection = local_connector(port, true).connect().await.unwrap();
        let reply = assemble_response(connection.as_mut(), &request()).await.unwrap();
        assert_eq!(reply.text, "Hello, Hello again");
        assert_eq!(reply.chat_id, None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn compressed_frame_without_negotiation_is_rejected() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, None).await;
            read_client_frame(&mut socket).await;
            let compressed = server_deflate(br#"{"type":"end"}"#);
            socket.write_all(&server_frame(OpCode::Data(Data::Text), compressed, true, true)).await.unwrap();
        }).await;

        let mut connection = local_connector(port, false).connect().await.unwrap();
        let result = assemble_response(connection.as_mut(), &request()).await;
        assert!(
            matches!(
                result,
                Err(ChatError::Transport(tungstenite::Error::Protocol(ProtocolError::NonZeroReservedBits)))
            )
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unrequested_extension_fails_handshake() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, Some("permessage-deflate")).await;
        }).await;

        let result = local_connector(port, false).connect().await;
        assert!(matches!(result, Err(ChatError::Extension(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_binary_frame_is_an_error() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, None).await;
            read_client_frame(&mut socket).await;
            socket
                .write_all(&server_frame(OpCode::Data(Data::Binary), vec![b'{', 0xff, 0xfe, b'}'], true, false)).await
                .unwrap();
        }).await;

        let mut connection = local_connector(port, false).connect().await.unwrap();
        let result = assemble_response(connection.as_mut(), &request()).await;
        assert!(matches!(result, Err(ChatError::InvalidUtf8(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn binary_frames_carry_json_too() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, None).await;
            read_client_frame(&mut socket).await;
            let body = br#"{"content":"bin","type":"end","chat_id":"b"}"#.to_vec();
            socket.write_all(&server_frame(OpCode::Data(Data::Binary), body, true, false)).await.unwrap();
        }).await;

        let mut connection = local_connector(port, false).connect().await.unwrap();
        let reply = assemble_response(connection.as_mut(), &request()).await.unwrap();
        assert_eq!(reply.text, "bin");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fragmented_and_interleaved_control_frames() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, None).await;
            read_client_frame(&mut socket).await;

            let first = server_frame(OpCode::Data(Data::Text), br#"{"content":"#.to_vec(), false, false);
            let ping = server_frame(OpCode::Control(Control::Ping), b"hb".to_vec(), true, false);
            let rest = server_frame(OpCode::Data(Data::Continue), br#""split"}"#.to_vec(), true, false);
            socket.write_all(&first).await.unwrap();
            socket.write_all(&ping).await.unwrap();
            socket.write_all(&rest).await.unwrap();

            let (pong, payload) = read_client_frame(&mut socket).await;
            assert_eq!(pong.opcode, OpCode::Control(Control::Pong));
            assert_eq!(payload, b"hb");

            socket.write_all(&text_frame(r#"{"type":"end","chat_id":"f"}"#)).await.unwrap();
        }).await;

        let mut connection = local_connector(port, false).connect().await.unwrap();
        let reply = assemble_response(connection.as_mut(), &request()).await.unwrap();
        assert_eq!(reply.text, "split");
        assert_eq!(reply.chat_id.as_deref(), Some("f"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (port, server) = raw_server(|mut socket| async move {
            answer_upgrade(&mut socket, None).await;
            socket.write_all(&text_frame(&"x".repeat(300))).await.unwrap();
        }).await;

        let listener_url = Url::parse(&format!("ws://127.0.0.1:{}/api/chat", port)).unwrap();
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let key = HandshakeKey::generate();
        let connector = WsConnector::new(listener_url, "o".to_string(), "ua".to_string(), false);
        let mut connection = WsConnection::handshake(stream, connector.build_request(&key).unwrap(), &key, false)
            .await
            .unwrap()
            .with_max_message_size(100);
        assert!(!connection.deflate_enabled());
        assert!(matches!(connection.recv_text().await, Err(ChatError::MessageTooLarge { size: 300, .. })));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tungstenite_server_streams_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let sent = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => text,
                other => panic!("unexpected message {:?}", other),
            };
            let sent: ChatRequest = serde_json::from_str(&sent).unwrap();
            assert_eq!(sent.prompt, vec![Turn::user("hi")]);

            ws.send(Message::Text(r#"{"content":"Hel"}"#.into())).await.unwrap();
            ws.send(Message::Ping(b"keepalive".to_vec())).await.unwrap();
            ws.send(Message::Text(r#"{"content":"lo "}"#.into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"end","chat_id":"t-1"}"#.into())).await.unwrap();

            assert_eq!(ws.next().await.unwrap().unwrap(), Message::Pong(b"keepalive".to_vec()));
            assert!(matches!(ws.next().await.unwrap().unwrap(), Message::Close(_)));
        });

        let mut connection = local_connector(port, true).connect().await.unwrap();
        let reply = assemble_response(connection.as_mut(), &request()).await.unwrap();
        assert_eq!(reply.text, "Hello");
        assert_eq!(reply.chat_id.as_deref(), Some("t-1"));
        connection.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_before_end_reports_stream_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(r#"{"content":"partial"}"#.into())).await.unwrap();
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut connection = local_connector(port, true).connect().await.unwrap();
        let result = assemble_response(connection.as_mut(), &request()).await;
        assert!(matches!(result, Err(ChatError::StreamClosed { frames: 1 })));
        assert!(connection.close().await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_upgrade_is_a_transport_error() {
        let (port, server) = raw_server(|mut socket| async move {
            read_upgrade_request(&mut socket).await;
            socket.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        }).await;

        let result = local_connector(port, true).connect().await;
        match result {
            Err(ChatError::Transport(tungstenite::Error::Http(response))) => {
                assert_eq!(response.status(), 403);
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("upgrade should fail"),
        }
        server.await.unwrap();
    }
}
