use std::net::SocketAddr;

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use camrelay_proto::frame::DEFAULT_DEPTH_SCALE;
use camrelay_proto::{
    FrameFanout, FrameJob, FrameUpload, Inbound, Outbound, ProcessedFrame,
    ServoControl, StatusBody, close, decode_binary_frame, decode_text,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval_at, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broadcast::{
    distribute_frame_to_viewers, distribute_text_to_viewers,
    distribute_to_viewers, enqueue,
};
use super::registry::{PeerHandle, Role};
use super::unix_time;
use crate::app::AppState;

const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;

/// How long the writer task gets to flush its queue after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn close_message(
    code: CloseCode,
    reason: &'static str,
) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

/// Runs one peer session to completion: attaches the role, spawns the
/// writer task, dispatches inbound messages, and detaches on every exit
/// path.
pub async fn run_session(
    mut ws: WebSocketStream<TcpStream>,
    role: Role,
    addr: SocketAddr,
    state: AppState,
) -> Result<()> {
    let (sender, outbound_rx) = mpsc::channel(state.config.session_queue_depth);
    let handle = PeerHandle { id: Uuid::new_v4(), role, addr, sender };

    let client_id = match role {
        Role::Producer => {
            if state.registry.attach_producer(handle.clone()).is_err() {
                warn!("a producer is already connected, rejecting: peer={addr}");
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: close::DUPLICATE_PRODUCER.into(),
                    }))
                    .await;
                return Ok(());
            }
            None
        }
        Role::Worker => {
            if state.registry.attach_worker(handle.clone()).is_err() {
                warn!("a worker is already connected, rejecting: peer={addr}");
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: close::DUPLICATE_WORKER.into(),
                    }))
                    .await;
                return Ok(());
            }
            None
        }
        Role::Viewer => Some(state.registry.attach_viewer(handle.clone())),
    };

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(run_writer(outbound_rx, sink));

    let connected = Outbound::Connected {
        message: match role {
            Role::Producer => "Connected as Pi client".to_string(),
            Role::Worker => "Connected as WSL processor".to_string(),
            Role::Viewer => "Connected to server".to_string(),
        },
        client_id,
        server_time: unix_time(),
    };
    send_to_peer(&state, &handle, &connected);

    read_loop(stream, &handle, &state).await;

    state.registry.detach(handle.id);
    info!("session ended: role={}, peer={}", role, addr);

    drop(handle);
    if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer drain timed out: peer={addr}");
    }

    Ok(())
}

/// Drains the session's outbound queue into the socket. A sent close frame
/// or a send error ends the task; pending messages behind a close are
/// discarded.
async fn run_writer(
    mut outbound_rx: mpsc::Receiver<Message>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    handle: &PeerHandle,
    state: &AppState,
) {
    let keepalive = state.config.keepalive_interval;
    let mut ping_tick = interval_at(Instant::now() + keepalive, keepalive);
    let mut pong_deadline: Option<Instant> = None;
    let mut saw_hello = false;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                break;
            }
            _ = ping_tick.tick() => {
                if pong_deadline.is_none() {
                    if !enqueue(&state.registry, handle, Message::Ping(Vec::new())) {
                        break;
                    }
                    pong_deadline = Some(Instant::now() + state.config.keepalive_timeout);
                }
            }
            _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!(
                    "keepalive timeout, closing session: role={}, peer={}",
                    handle.role, handle.addr
                );
                let _ = handle
                    .sender
                    .try_send(close_message(CloseCode::Error, "keepalive ping timeout"));
                break;
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        saw_hello |= dispatch_text(handle, state, &text).await;
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        if handle.role == Role::Producer {
                            ingest_binary_frame(state, Bytes::from(payload)).await;
                        } else {
                            warn!(
                                "unexpected binary message: role={}, peer={}, bytes={}",
                                handle.role,
                                handle.addr,
                                payload.len()
                            );
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong reply itself
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(
                            "peer disconnected: role={}, peer={}",
                            handle.role, handle.addr
                        );
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        warn!(
                            "session read failed: role={}, peer={}, error={}",
                            handle.role, handle.addr, err
                        );
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if !saw_hello {
        debug!(
            "session ended without hello handshake: role={}, peer={}",
            handle.role, handle.addr
        );
    }
}

/// Decodes and dispatches one text message. Returns whether it was a
/// `hello`, so the session can note peers that never handshake.
async fn dispatch_text(
    handle: &PeerHandle,
    state: &AppState,
    text: &str,
) -> bool {
    if handle.role == Role::Viewer {
        state.registry.touch_viewer(handle.id);
    }

    let inbound = match decode_text(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            error!(
                "invalid json from {}: peer={}, error={}",
                handle.role, handle.addr, err
            );
            return false;
        }
    };

    debug!("{} message: kind={}", handle.role, inbound.kind());
    let is_hello = matches!(inbound, Inbound::Hello(_));

    match handle.role {
        Role::Viewer => handle_viewer_message(handle, state, inbound),
        Role::Producer => handle_producer_message(handle, state, inbound, text).await,
        Role::Worker => handle_worker_message(handle, state, inbound),
    }

    is_hello
}

fn handle_viewer_message(
    handle: &PeerHandle,
    state: &AppState,
    inbound: Inbound,
) {
    match inbound {
        Inbound::Ping => send_pong(state, handle),
        Inbound::Hello(_) => {
            info!("hello from viewer: peer={}", handle.addr);
            send_welcome(state, handle);
        }
        Inbound::ServoControl(request) => {
            handle_servo_control(handle, state, &request);
        }
        Inbound::RequestStatus => {
            let snapshot = state.registry.status_snapshot();
            let message = Outbound::Status(StatusBody::Report {
                pi_connected: snapshot.pi_connected,
                wsl_connected: snapshot.wsl_connected,
                browser_clients: snapshot.browser_clients,
                processed_frames: state.processed.len(),
                servo_state: snapshot.servo_state,
                timestamp: unix_time(),
            });
            send_to_peer(state, handle, &message);
        }
        other => {
            warn!(
                "unknown viewer message type: kind={}, peer={}",
                other.kind(),
                handle.addr
            );
        }
    }
}

/// Servo updates only apply while a producer is attached; the registry
/// merges the request and hands back the matching producer handle so the
/// forward and the ack carry the same pose.
fn handle_servo_control(
    handle: &PeerHandle,
    state: &AppState,
    request: &ServoControl,
) {
    match state.registry.apply_servo(request) {
        Some((servo_state, producer)) => {
            let timestamp = unix_time();
            send_to_peer(state, &producer, &Outbound::Control {
                action: "move_servos".to_string(),
                params: servo_state,
                timestamp,
            });
            send_to_peer(state, handle, &Outbound::ServoUpdated {
                state: servo_state,
                timestamp,
            });
        }
        None => {
            send_to_peer(state, handle, &Outbound::Error {
                error: "Pi not connected".to_string(),
                timestamp: unix_time(),
            });
        }
    }
}

async fn handle_producer_message(
    handle: &PeerHandle,
    state: &AppState,
    inbound: Inbound,
    text: &str,
) {
    match inbound {
        Inbound::Ping => send_pong(state, handle),
        Inbound::Hello(hello) => {
            info!(
                "hello from producer: hostname={}, supports_binary={}",
                hello.hostname.as_deref().unwrap_or("unknown"),
                hello.client_info.supports_binary
            );
            send_welcome(state, handle);
        }
        Inbound::Frame(upload) => ingest_json_frame(state, upload).await,
        Inbound::Telemetry(_) => {
            // opaque fan-out: viewers get the producer's payload verbatim
            distribute_text_to_viewers(&state.registry, text.to_string(), None);
        }
        other => {
            warn!(
                "unknown producer message type: kind={}, peer={}",
                other.kind(),
                handle.addr
            );
        }
    }
}

fn handle_worker_message(
    handle: &PeerHandle,
    state: &AppState,
    inbound: Inbound,
) {
    match inbound {
        Inbound::Ping => send_pong(state, handle),
        Inbound::Hello(_) => {
            info!("hello from worker: peer={}", handle.addr);
            send_welcome(state, handle);
        }
        Inbound::ProcessedFrame(result) => handle_worker_result(state, result),
        other => {
            warn!(
                "unknown worker message type: kind={}, peer={}",
                other.kind(),
                handle.addr
            );
        }
    }
}

/// Ingests a binary uplink frame: decode, base64 the payloads once, tee to
/// the worker, fan out to viewers. Decode failures drop the frame and keep
/// the session.
async fn ingest_binary_frame(
    state: &AppState,
    payload: Bytes,
) {
    let frame = match decode_binary_frame(&payload) {
        Ok(frame) => frame,
        Err(err) => {
            error!("binary frame rejected: bytes={}, error={}", payload.len(), err);
            return;
        }
    };

    debug!(
        "binary frame received: frame_id={}, bytes={}, color={}, depth={}",
        frame.frame_id,
        payload.len(),
        frame.color.is_some(),
        frame.depth.is_some()
    );

    let image = frame.color.as_ref().map(|color| BASE64.encode(color));
    let depth_data = frame.depth.as_ref().map(|depth| BASE64.encode(&depth.data));
    let depth_scale = frame.depth.as_ref().map(|depth| depth.scale);
    let timestamp = f64::from(frame.timestamp);

    tee_to_worker(state, FrameJob {
        frame_id: frame.frame_id,
        timestamp,
        image: image.clone(),
        depth_data: depth_data.clone(),
        depth_scale,
        camera_info: None,
    })
    .await;

    let fanout = Outbound::Frame(FrameFanout {
        frame_id: frame.frame_id,
        timestamp,
        image,
        processed: false,
        binary_received: Some(true),
        depth_data,
        depth_scale,
        width: None,
        height: None,
        camera_info: None,
    });
    if let Err(err) = distribute_frame_to_viewers(&state.registry, &fanout) {
        error!("frame fan-out encode failed: error={err}");
    }
}

/// Ingests a JSON frame whose payloads are already base64.
async fn ingest_json_frame(
    state: &AppState,
    upload: FrameUpload,
) {
    let timestamp = upload.timestamp.unwrap_or_else(unix_time);
    let camera_info =
        Some(upload.camera_info.clone().unwrap_or_else(|| serde_json::json!({})));

    tee_to_worker(state, FrameJob {
        frame_id: upload.frame_id,
        timestamp,
        image: upload.image.clone(),
        depth_data: None,
        depth_scale: None,
        camera_info: camera_info.clone(),
    })
    .await;

    let has_depth = upload.depth_data.is_some();
    if has_depth {
        debug!("forwarding frame with depth data: frame_id={}", upload.frame_id);
    }

    let fanout = Outbound::Frame(FrameFanout {
        frame_id: upload.frame_id,
        timestamp,
        image: upload.image,
        processed: false,
        binary_received: None,
        depth_data: upload.depth_data,
        depth_scale: has_depth
            .then(|| upload.depth_scale.unwrap_or(DEFAULT_DEPTH_SCALE)),
        width: has_depth.then(|| upload.width.unwrap_or(DEFAULT_FRAME_WIDTH)),
        height: has_depth.then(|| upload.height.unwrap_or(DEFAULT_FRAME_HEIGHT)),
        camera_info,
    });
    if let Err(err) = distribute_frame_to_viewers(&state.registry, &fanout) {
        error!("frame fan-out encode failed: error={err}");
    }
}

/// Admits the frame into the bounded pipeline and forwards the job to the
/// worker. Admission timeout or a failed forward drops the frame from the
/// pipeline without touching the session.
async fn tee_to_worker(
    state: &AppState,
    job: FrameJob,
) {
    let Some(worker) = state.registry.worker() else {
        return;
    };

    let frame_id = job.frame_id;
    if !state.pipeline.admit(frame_id, job.timestamp).await {
        warn!("processing queue full, skipping frame: frame_id={frame_id}");
        return;
    }

    match Outbound::FrameToProcess(job).to_text() {
        Ok(text) => {
            if !enqueue(&state.registry, &worker, Message::Text(text)) {
                state.pipeline.resolve(frame_id);
            }
        }
        Err(err) => {
            error!("worker job encode failed: error={err}");
            state.pipeline.resolve(frame_id);
        }
    }
}

/// Resolves a detection result against the pipeline and forwards it to the
/// producer (without timing) and to every viewer (with timing). Late
/// results for untracked frames are still delivered.
fn handle_worker_result(
    state: &AppState,
    result: ProcessedFrame,
) {
    let timestamp = unix_time();

    if state.processed.get(result.frame_id).is_some() {
        debug!("duplicate detection result: frame_id={}", result.frame_id);
    }
    state.processed.insert(result.frame_id, result.detections.clone());

    if state.pipeline.resolve(result.frame_id).is_none() {
        debug!("detection result for untracked frame: frame_id={}", result.frame_id);
    }

    if let Some(producer) = state.registry.producer() {
        send_to_peer(state, &producer, &Outbound::DetectionResult {
            frame_id: result.frame_id,
            detections: result.detections.clone(),
            timestamp,
            processing_time: None,
        });
    }

    let viewer_copy = Outbound::DetectionResult {
        frame_id: result.frame_id,
        detections: result.detections,
        timestamp,
        processing_time: Some(result.processing_time.unwrap_or(0.0)),
    };
    if let Err(err) = distribute_to_viewers(&state.registry, &viewer_copy, None) {
        error!("detection fan-out encode failed: error={err}");
    }
}

fn send_pong(
    state: &AppState,
    handle: &PeerHandle,
) {
    send_to_peer(state, handle, &Outbound::Pong { timestamp: unix_time() });
}

fn send_welcome(
    state: &AppState,
    handle: &PeerHandle,
) {
    let snapshot = state.registry.status_snapshot();
    send_to_peer(state, handle, &Outbound::Welcome {
        message: "Welcome to the server".to_string(),
        server_time: unix_time(),
        pi_connected: snapshot.pi_connected,
        wsl_connected: snapshot.wsl_connected,
        binary_frames_supported: true,
    });
}

fn send_to_peer(
    state: &AppState,
    handle: &PeerHandle,
    message: &Outbound,
) {
    match message.to_text() {
        Ok(text) => {
            enqueue(&state.registry, handle, Message::Text(text));
        }
        Err(err) => error!("failed to encode outbound message: error={err}"),
    }
}
