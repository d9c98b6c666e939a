//! Minimal RTSP 1.0 client for pulling one H.264 stream over TCP
//!
//! Only the subset the relay needs is implemented: OPTIONS, DESCRIBE, SETUP
//! with interleaved TCP transport, PLAY, TEARDOWN and OPTIONS keepalives.
//! RTP packets arriving on the negotiated interleaved channel are handed to
//! a synchronous callback registered with [`RtspClient::on_packet_rtp`].

use std::time::Duration;

use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use rtp::packet::Packet;
use rtsp_types as rtsp;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;
use webrtc::util::Unmarshal;

use crate::error::{AppError, Result};

const RTSP_BUF_SIZE: usize = 8192;
// Largest interleaved frame is 4 + 65535 bytes; anything bigger is junk
const MAX_PENDING_BYTES: usize = 128 * 1024;
const DEFAULT_RTSP_PORT: u16 = 554;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(500);
const USER_AGENT: &str = concat!("feed-relay/", env!("CARGO_PKG_VERSION"));

/// Callback invoked synchronously for every RTP packet; must not block
pub type PacketCallback = Box<dyn FnMut(Packet) + Send>;

/// Parse and validate the configured source address
pub fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AppError::Config(format!("invalid source URL {:?}: {}", raw, e)))?;

    if !url.scheme().eq_ignore_ascii_case("rtsp") {
        return Err(AppError::Config(format!(
            "unsupported source URL scheme {:?} (expected rtsp)",
            url.scheme()
        )));
    }
    if url.host().is_none() {
        return Err(AppError::Config(format!("source URL {:?} has no host", raw)));
    }

    Ok(url)
}

/// Source URL with credentials removed, safe to log
pub fn redact_url(url: &Url) -> String {
    let mut clean = url.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.to_string()
}

/// Session established by SETUP
#[derive(Debug, Clone, PartialEq)]
pub struct RtspSession {
    pub id: String,
    pub timeout: Duration,
}

/// DESCRIBE result: the SDP and the URL media controls are relative to
#[derive(Debug)]
pub struct Description {
    pub base: Url,
    pub sdp: sdp_types::Session,
}

#[derive(Debug)]
enum Frame {
    Interleaved { channel: u8, data: Bytes },
    Response(rtsp::Response<Vec<u8>>),
    Request {
        method: rtsp::Method,
        cseq: Option<String>,
    },
}

pub struct RtspClient<S = TcpStream> {
    stream: S,
    url: Url,
    credentials: Option<(String, String)>,
    authorization: Option<String>,
    cseq: u32,
    session: Option<RtspSession>,
    rtp_channel: Option<u8>,
    buf: BytesMut,
    request_timeout: Duration,
    read_timeout: Duration,
    on_packet: Option<PacketCallback>,
}

impl RtspClient<TcpStream> {
    /// Open the TCP connection to the host named in `url`
    pub async fn connect(
        url: &Url,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(AppError::Config("source URL has no host".to_string())),
        };
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| AppError::Rtsp(format!("connect to {}:{} timed out", host, port)))??;
        stream.set_nodelay(true)?;

        debug!("RTSP connected to {}:{}", host, port);
        Ok(Self::new(stream, url.clone(), request_timeout))
    }
}

impl<S> RtspClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established transport
    pub fn new(stream: S, url: Url, request_timeout: Duration) -> Self {
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };

        let mut request_url = url;
        let _ = request_url.set_username("");
        let _ = request_url.set_password(None);

        Self {
            stream,
            url: request_url,
            credentials,
            authorization: None,
            cseq: 0,
            session: None,
            rtp_channel: None,
            buf: BytesMut::with_capacity(RTSP_BUF_SIZE),
            request_timeout,
            read_timeout: DEFAULT_READ_TIMEOUT,
            on_packet: None,
        }
    }

    /// Request URL (credentials stripped)
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn session(&self) -> Option<&RtspSession> {
        self.session.as_ref()
    }

    /// Interleaved channel RTP arrives on, once SETUP succeeded
    pub fn rtp_channel(&self) -> Option<u8> {
        self.rtp_channel
    }

    /// Longest silence tolerated by [`RtspClient::run`] before it gives up
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Register the packet callback; replaces any previous one
    pub fn on_packet_rtp(&mut self, callback: PacketCallback) {
        self.on_packet = Some(callback);
    }

    /// Capability query
    pub async fn options(&mut self) -> Result<Vec<String>> {
        let url = self.url.clone();
        let response = self.request(rtsp::Method::Options, &url, Vec::new()).await?;
        let public = response
            .header(&rtsp::headers::PUBLIC)
            .map(|value| {
                value
                    .as_str()
                    .split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(public)
    }

    /// Fetch and parse the session description
    pub async fn describe(&mut self) -> Result<Description> {
        let url = self.url.clone();
        let response = self
            .request(
                rtsp::Method::Describe,
                &url,
                vec![(rtsp::headers::ACCEPT, "application/sdp".to_string())],
            )
            .await?;

        let base = content_base(&response, &url);
        let sdp = sdp_types::Session::parse(response.body())
            .map_err(|e| AppError::Rtsp(format!("invalid SDP in DESCRIBE response: {:?}", e)))?;

        Ok(Description { base, sdp })
    }

    /// Set up one media stream with interleaved TCP transport
    pub async fn setup(&mut self, control: &Url, channel: u8) -> Result<RtspSession> {
        let transport = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            channel,
            channel.saturating_add(1)
        );
        let response = self
            .request(
                rtsp::Method::Setup,
                control,
                vec![(rtsp::headers::TRANSPORT, transport)],
            )
            .await?;

        let session = response
            .header(&rtsp::headers::SESSION)
            .and_then(|value| parse_session_header(value.as_str()))
            .ok_or_else(|| AppError::Rtsp("SETUP response carries no Session header".to_string()))?;

        let negotiated = response
            .header(&rtsp::headers::TRANSPORT)
            .and_then(|value| parse_interleaved_channel(value.as_str()))
            .unwrap_or(channel);
        if negotiated != channel {
            debug!("RTSP server moved interleaved channel {} -> {}", channel, negotiated);
        }

        self.rtp_channel = Some(negotiated);
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Start delivery for the aggregate URL
    pub async fn play(&mut self, url: &Url) -> Result<()> {
        if self.session.is_none() {
            return Err(AppError::Rtsp("PLAY before SETUP".to_string()));
        }
        self.request(
            rtsp::Method::Play,
            url,
            vec![(rtsp::headers::RANGE, "npt=0.000-".to_string())],
        )
        .await?;
        Ok(())
    }

    /// Best-effort TEARDOWN; errors are only logged
    pub async fn teardown(&mut self) {
        if self.session.is_none() {
            return;
        }
        let url = self.url.clone();
        let cseq = self.next_cseq();
        let result = tokio::time::timeout(
            TEARDOWN_TIMEOUT,
            self.write_request(rtsp::Method::Teardown, &url, &[], cseq),
        )
        .await;
        match result {
            Ok(Ok(())) => debug!("RTSP TEARDOWN sent"),
            Ok(Err(e)) => debug!("RTSP TEARDOWN failed: {}", e),
            Err(_) => debug!("RTSP TEARDOWN timed out"),
        }
        self.session = None;
    }

    /// Receive loop while playing
    ///
    /// Returns `Ok(())` once `cancel` fires (after a TEARDOWN), and an error
    /// when the server closes the connection, the transport fails or nothing
    /// arrives for the read timeout.
    pub async fn run(&mut self, cancel: &CancellationToken, keepalive: bool) -> Result<()> {
        let period = self
            .session
            .as_ref()
            .map(|s| s.timeout / 2)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT / 2)
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let read_timeout = self.read_timeout;
        let mut deadline = tokio::time::Instant::now() + read_timeout;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.teardown().await;
                    return Ok(());
                }
                _ = ticker.tick(), if keepalive => {
                    self.send_keepalive().await?;
                }
                frame = tokio::time::timeout_at(deadline, self.read_frame()) => {
                    let frame = frame.map_err(|_| {
                        AppError::Rtsp(format!("no data from source for {:?}", read_timeout))
                    })??;
                    deadline = tokio::time::Instant::now() + read_timeout;

                    match frame {
                        Frame::Interleaved { channel, data } => self.dispatch_interleaved(channel, data),
                        Frame::Response(response) => {
                            trace!("RTSP keepalive answered: {:?}", response.status());
                        }
                        Frame::Request { method, cseq } => self.reject_request(method, cseq).await?,
                    }
                }
            }
        }
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        let url = self.url.clone();
        let cseq = self.next_cseq();
        trace!("RTSP keepalive (CSeq {})", cseq);
        self.write_request(rtsp::Method::Options, &url, &[], cseq).await
    }

    fn dispatch_interleaved(&mut self, channel: u8, mut data: Bytes) {
        if Some(channel) != self.rtp_channel {
            // RTCP or a channel we never set up
            trace!("Skipping {} bytes on interleaved channel {}", data.len(), channel);
            return;
        }

        match Packet::unmarshal(&mut data) {
            Ok(packet) => {
                if let Some(callback) = self.on_packet.as_mut() {
                    callback(packet);
                }
            }
            Err(e) => {
                debug!("Discarding malformed RTP packet: {}", e);
            }
        }
    }

    async fn request(
        &mut self,
        method: rtsp::Method,
        url: &Url,
        headers: Vec<(rtsp::HeaderName, String)>,
    ) -> Result<rtsp::Response<Vec<u8>>> {
        let response = self.exchange(method.clone(), url, &headers).await?;

        if response.status() == rtsp::StatusCode::Unauthorized && self.authorization.is_none() {
            if let Some(authorization) = self.basic_authorization() {
                debug!("RTSP server requires authentication, retrying {:?}", method);
                self.authorization = Some(authorization);
                let response = self.exchange(method.clone(), url, &headers).await?;
                return check_status(&method, response);
            }
        }

        check_status(&method, response)
    }

    async fn exchange(
        &mut self,
        method: rtsp::Method,
        url: &Url,
        headers: &[(rtsp::HeaderName, String)],
    ) -> Result<rtsp::Response<Vec<u8>>> {
        let cseq = self.next_cseq();
        let label = format!("{:?}", method);
        self.write_request(method, url, headers, cseq).await?;

        tokio::time::timeout(self.request_timeout, self.read_response(cseq))
            .await
            .map_err(|_| AppError::Rtsp(format!("timed out waiting for {} response", label)))?
    }

    async fn write_request(
        &mut self,
        method: rtsp::Method,
        url: &Url,
        headers: &[(rtsp::HeaderName, String)],
        cseq: u32,
    ) -> Result<()> {
        let mut builder = rtsp::Request::builder(method, rtsp::Version::V1_0)
            .request_uri(url.clone())
            .header(rtsp::headers::CSEQ, cseq.to_string())
            .header(rtsp::headers::USER_AGENT, USER_AGENT);

        if let Some(authorization) = self.authorization.as_deref() {
            builder = builder.header(rtsp::headers::AUTHORIZATION, authorization);
        }
        if let Some(session) = self.session.as_ref() {
            builder = builder.header(rtsp::headers::SESSION, session.id.as_str());
        }
        for (name, value) in headers {
            builder = builder.header(name.clone(), value.as_str());
        }

        let request = builder.build(Vec::<u8>::new());
        let mut data = Vec::new();
        request
            .write(&mut data)
            .map_err(|e| AppError::Rtsp(format!("failed to serialize RTSP request: {:?}", e)))?;
        self.stream.write_all(&data).await?;
        Ok(())
    }

    async fn read_response(&mut self, cseq: u32) -> Result<rtsp::Response<Vec<u8>>> {
        loop {
            match self.read_frame().await? {
                Frame::Response(response) => {
                    let matches = response
                        .header(&rtsp::headers::CSEQ)
                        .and_then(|value| value.as_str().trim().parse::<u32>().ok())
                        .map(|value| value == cseq)
                        .unwrap_or(true);
                    if matches {
                        return Ok(response);
                    }
                    trace!("Skipping RTSP response for an earlier request");
                }
                Frame::Interleaved { channel, data } => self.dispatch_interleaved(channel, data),
                Frame::Request { method, cseq } => self.reject_request(method, cseq).await?,
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = take_frame(&mut self.buf)? {
                return Ok(frame);
            }

            if self.buf.len() > MAX_PENDING_BYTES {
                return Err(AppError::Rtsp(format!(
                    "unterminated RTSP message from server ({} bytes buffered)",
                    self.buf.len()
                )));
            }

            self.buf.reserve(RTSP_BUF_SIZE);
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(AppError::Rtsp("connection closed by server".to_string()));
            }
        }
    }

    /// Answer a server-initiated request with 501 so the server keeps the session
    async fn reject_request(&mut self, method: rtsp::Method, cseq: Option<String>) -> Result<()> {
        debug!("Rejecting server-initiated RTSP {:?}", method);

        let mut builder =
            rtsp::Response::builder(rtsp::Version::V1_0, rtsp::StatusCode::NotImplemented);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp::headers::CSEQ, cseq);
        }
        let response = builder.build(Vec::<u8>::new());

        let mut data = Vec::new();
        response
            .write(&mut data)
            .map_err(|e| AppError::Rtsp(format!("failed to serialize RTSP response: {:?}", e)))?;
        self.stream.write_all(&data).await?;
        Ok(())
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq = self.cseq.wrapping_add(1);
        self.cseq
    }

    fn basic_authorization(&self) -> Option<String> {
        let (user, pass) = self.credentials.as_ref()?;
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", token))
    }
}

fn check_status(
    method: &rtsp::Method,
    response: rtsp::Response<Vec<u8>>,
) -> Result<rtsp::Response<Vec<u8>>> {
    if response.status() == rtsp::StatusCode::Ok {
        Ok(response)
    } else {
        warn!("RTSP {:?} failed with {:?}", method, response.status());
        Err(AppError::RtspStatus {
            method: format!("{:?}", method).to_uppercase(),
            status: format!("{:?}", response.status()),
        })
    }
}

/// Pop one complete interleaved frame or RTSP message off the buffer
fn take_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'$' {
        if buf.len() < 4 {
            return Ok(None);
        }
        let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + payload_len {
            return Ok(None);
        }
        let channel = buf[1];
        let mut frame = buf.split_to(4 + payload_len);
        frame.advance(4);
        return Ok(Some(Frame::Interleaved {
            channel,
            data: frame.freeze(),
        }));
    }

    let parsed: std::result::Result<(rtsp::Message<Vec<u8>>, usize), rtsp::ParseError> =
        rtsp::Message::parse(&buf[..]);
    match parsed {
        Ok((message, consumed)) => {
            buf.advance(consumed);
            match message {
                rtsp::Message::Response(response) => Ok(Some(Frame::Response(response))),
                rtsp::Message::Request(request) => Ok(Some(Frame::Request {
                    method: request.method().clone(),
                    cseq: request
                        .header(&rtsp::headers::CSEQ)
                        .map(|value| value.as_str().trim().to_string()),
                })),
                rtsp::Message::Data(data) => Ok(Some(Frame::Interleaved {
                    channel: data.channel_id(),
                    data: Bytes::from(data.into_body()),
                })),
            }
        }
        Err(rtsp::ParseError::Incomplete(_)) => Ok(None),
        Err(e) => Err(AppError::Rtsp(format!("malformed RTSP message from server: {:?}", e))),
    }
}

fn content_base(response: &rtsp::Response<Vec<u8>>, request_url: &Url) -> Url {
    [rtsp::headers::CONTENT_BASE, rtsp::headers::CONTENT_LOCATION]
        .iter()
        .filter_map(|name| response.header(name))
        .find_map(|value| Url::parse(value.as_str().trim()).ok())
        .unwrap_or_else(|| request_url.clone())
}

/// `Session: <id>[;timeout=<secs>]`
fn parse_session_header(value: &str) -> Option<RtspSession> {
    let mut parts = value.split(';');
    let id = parts.next()?.trim();
    if id.is_empty() {
        return None;
    }

    let timeout = parts
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("timeout"))
        .and_then(|(_, secs)| secs.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);

    Some(RtspSession {
        id: id.to_string(),
        timeout,
    })
}

fn parse_interleaved_channel(transport: &str) -> Option<u8> {
    let lower = transport.to_ascii_lowercase();
    if let Some((_, v)) = lower.split_once("interleaved=") {
        let head = v.split(';').next().unwrap_or(v);
        let first = head.split('-').next().unwrap_or(head).trim();
        return first.parse::<u8>().ok();
    }
    None
}
