//! End-to-end relay behaviour against a scripted RTSP camera on loopback

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::util::Marshal;

use feed_relay::config::{AppConfig, ConfigStore, SourceConfig};
use feed_relay::hub::FanoutHub;
use feed_relay::packet::new_packet;
use feed_relay::rtsp::{SourceController, SourceState};
use feed_relay::state::AppState;
use feed_relay::AppError;

const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Scripted Camera\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;profile-level-id=42e01f\r\n\
a=control:trackID=0\r\n";

/// Minimal RTSP camera: answers the handshake, then streams RTP until the
/// client goes away
struct Camera {
    connections: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Camera {
    async fn start(addr: SocketAddr) -> Self {
        Self::spawn(addr, true).await
    }

    /// Completes the handshake, then never sends a packet
    async fn start_silent(addr: SocketAddr) -> Self {
        Self::spawn(addr, false).await
    }

    async fn spawn(addr: SocketAddr, streaming: bool) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, addr, streaming));
            }
        });

        Self { connections, task }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<(String, String)> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.ok()? == 0 {
        return None;
    }
    let method = request_line.split_whitespace().next()?.to_string();

    let mut cseq = String::from("0");
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("cseq") {
                cseq = value.trim().to_string();
            }
        }
    }
    Some((method, cseq))
}

fn ok(cseq: &str, headers: &str, body: &str) -> String {
    let mut reply = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}", cseq, headers);
    if !body.is_empty() {
        reply.push_str(&format!(
            "Content-Type: application/sdp\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    reply.push_str("\r\n");
    reply.push_str(body);
    reply
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, streaming: bool) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let Some((method, cseq)) = read_request(&mut reader).await else {
            return;
        };
        let (reply, playing) = match method.as_str() {
            "OPTIONS" => (
                ok(&cseq, "Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN\r\n", ""),
                false,
            ),
            "DESCRIBE" => (
                ok(
                    &cseq,
                    &format!("Content-Base: rtsp://{}/live/\r\n", addr),
                    SDP,
                ),
                false,
            ),
            "SETUP" => (
                ok(
                    &cseq,
                    "Session: CAFE01;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n",
                    "",
                ),
                false,
            ),
            "PLAY" => (ok(&cseq, "Session: CAFE01\r\n", ""), true),
            _ => (ok(&cseq, "", ""), false),
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
        if playing {
            break;
        }
    }

    // Keep draining requests (keepalives, TEARDOWN) so the client never blocks
    tokio::spawn(async move { while read_request(&mut reader).await.is_some() {} });

    if !streaming {
        // Hold the connection open without sending anything
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(write_half);
        return;
    }

    let mut seq: u16 = 1000;
    let mut timestamp: u32 = 4_000_000_000;
    loop {
        let packet = new_packet(96, seq, timestamp, true, Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]));
        let Ok(data) = packet.marshal() else {
            return;
        };
        let mut frame = vec![b'$', 0];
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
        frame.extend_from_slice(&data);
        if write_half.write_all(&frame).await.is_err() {
            return;
        }

        seq = seq.wrapping_add(1);
        timestamp = timestamp.wrapping_add(3000);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A loopback address nothing is listening on yet
fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn source_config(addr: SocketAddr) -> SourceConfig {
    SourceConfig {
        url: format!("rtsp://{}/live", addr),
        reconnect_delay_ms: 200,
        connect_timeout_ms: 500,
        request_timeout_ms: 1000,
        read_timeout_ms: 1000,
        keepalive: true,
    }
}

async fn browser_offer() -> (RTCPeerConnection, String) {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media_engine).build();

    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();
    pc.add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .unwrap();

    let offer = pc.create_offer(None).await.unwrap();
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), gathered.recv()).await;

    let sdp = pc.local_description().await.unwrap().sdp;
    (pc, sdp)
}

fn relay_state(addr: SocketAddr) -> Arc<AppState> {
    let mut config = AppConfig::default();
    config.source = source_config(addr);
    config.webrtc.gathering_timeout_ms = 3000;
    let (shutdown_tx, _) = broadcast::channel(1);
    AppState::new(ConfigStore::from_config(config), shutdown_tx)
}

#[tokio::test]
async fn packets_flow_once_an_unreachable_source_comes_up() {
    let addr = free_addr();
    let controller = SourceController::new(source_config(addr), FanoutHub::new(64));
    controller.ensure_started().unwrap();
    let mut subscription = controller.hub().subscribe();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(subscription.try_recv().is_none());
    assert_ne!(controller.state(), SourceState::Playing);

    let camera = Camera::start(addr).await;

    let mut state_rx = controller.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(3),
        state_rx.wait_for(|state| *state == SourceState::Playing),
    )
    .await
    .expect("source never reached playing")
    .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(3), subscription.recv())
        .await
        .expect("no packet within one reconnect interval")
        .expect("subscription closed");
    assert_eq!(first.header.payload_type, 96);

    let second = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        second.header.sequence_number,
        first.header.sequence_number.wrapping_add(1)
    );
    assert_eq!(controller.state(), SourceState::Playing);
    assert!(camera.connections() >= 1);

    controller.shutdown();
    controller.join().await;
    assert_eq!(controller.state(), SourceState::Closed);
    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn concurrent_starts_open_a_single_upstream_connection() {
    let addr = free_addr();
    let camera = Camera::start(addr).await;
    let controller = Arc::new(SourceController::new(source_config(addr), FanoutHub::new(64)));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move { controller.ensure_started() }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut subscription = controller.hub().subscribe();
    tokio::time::timeout(Duration::from_secs(3), subscription.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(controller.starts(), 1);
    assert_eq!(camera.connections(), 1);
    controller.shutdown();
    controller.join().await;
}

#[tokio::test]
async fn malformed_source_url_is_reported_to_the_viewer() {
    let mut config = AppConfig::default();
    config.source.url = "not-a-url".to_string();
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = AppState::new(ConfigStore::from_config(config), shutdown_tx);

    let (_browser, offer) = browser_offer().await;
    let result = state.negotiator.negotiate(&offer).await;

    assert!(matches!(result, Err(AppError::Config(_))));
    assert_eq!(state.hub().subscriber_count(), 0);
    assert_eq!(state.sessions.count().await, 0);
}

#[tokio::test]
async fn viewer_gets_an_answer_while_the_source_is_down() {
    let state = relay_state(free_addr());

    let (_browser, offer) = browser_offer().await;
    let answer = tokio::time::timeout(Duration::from_secs(10), state.negotiator.negotiate(&offer))
        .await
        .unwrap()
        .unwrap();

    assert!(answer.sdp.contains("m=video"));
    assert!(answer.sdp.contains("H264/90000"));
    assert!(state.source.is_started());
    assert_eq!(state.hub().subscriber_count(), 1);
    assert_eq!(state.sessions.count().await, 1);

    state.shutdown().await;
    assert_eq!(state.hub().subscriber_count(), 0);
    assert_eq!(state.sessions.count().await, 0);
}

#[tokio::test]
async fn closing_one_viewer_leaves_the_other_subscribed() {
    let state = relay_state(free_addr());

    let (_browser_a, offer_a) = browser_offer().await;
    let (_browser_b, offer_b) = browser_offer().await;
    let a = state.negotiator.negotiate(&offer_a).await.unwrap();
    let b = state.negotiator.negotiate(&offer_b).await.unwrap();
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(state.hub().subscriber_count(), 2);
    assert_eq!(state.source.starts(), 1);

    state.sessions.close(&a.session_id).await.unwrap();
    assert_eq!(state.hub().subscriber_count(), 1);

    let viewer_b = state.sessions.get(&b.session_id).await.unwrap();
    assert!(!viewer_b.is_closed());

    let delivered = state
        .hub()
        .broadcast(Arc::new(new_packet(96, 1, 0, true, Bytes::from_static(&[0x65]))));
    assert_eq!(delivered, 1);
    let stats = state.hub().stats();
    assert_eq!(stats.subscriptions.len(), 1);
    assert_eq!(stats.subscriptions[0].id, viewer_b.subscription_id());

    state.shutdown().await;
}

#[tokio::test]
async fn empty_offer_allocates_no_subscription() {
    let state = relay_state(free_addr());

    let result = state.negotiator.negotiate("").await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert_eq!(state.hub().subscriber_count(), 0);
    assert!(!state.source.is_started());
}

#[tokio::test]
async fn wedged_source_is_abandoned_and_reconnected() {
    let addr = free_addr();
    let camera = Camera::start_silent(addr).await;
    let mut config = source_config(addr);
    config.read_timeout_ms = 300;
    let controller = SourceController::new(config, FanoutHub::new(8));
    controller.ensure_started().unwrap();

    let mut state_rx = controller.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state_rx.wait_for(|state| *state == SourceState::Playing),
    )
    .await
    .unwrap()
    .unwrap();

    // Read timeout plus reconnect delay, with slack
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(camera.connections() >= 2);
    assert!(controller.status().attempts >= 2);

    controller.shutdown();
    controller.join().await;
}
