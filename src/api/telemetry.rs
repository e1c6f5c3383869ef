//! WebSocket observers
//!
//! Level sockets carry one recorder's telemetry until its feed ends. The
//! fleet socket polls every recorder's latest reading at a fixed rate. The
//! event socket relays every [`FleetEvent`].

use super::{ApiError, AppState};
use crate::events::FleetEvent;
use crate::fleet::{Fleet, RecorderLevels};
use crate::recorder::RecorderId;
use crate::telemetry::{LevelSample, Subscription, TelemetryEvent};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const KEEPALIVE: Duration = Duration::from_secs(30);
/// About 30 frames per second
const FLEET_FRAME_PERIOD: Duration = Duration::from_micros(33_333);

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LevelFrame<'a> {
    Levels(&'a LevelSample),
    End { reason: &'a str },
    Pong,
    Keepalive,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FleetFrame<'a> {
    AllLevels {
        at: DateTime<Utc>,
        recorders: &'a [RecorderLevels],
    },
    Pong,
    Keepalive,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventFrame {
    Lagged { missed: u64 },
    Pong,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
}

fn is_ping(text: &str) -> bool {
    matches!(serde_json::from_str::<ClientFrame>(text), Ok(ClientFrame::Ping))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, frame: &T) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}

pub async fn recorder_levels(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let subscription = state.fleet.subscribe_recorder(RecorderId(id))?;
    Ok(ws.on_upgrade(move |socket| stream_levels(socket, subscription)))
}

pub async fn studio_levels(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let subscription = state.fleet.subscribe_studio(&id)?;
    Ok(ws.on_upgrade(move |socket| stream_levels(socket, subscription)))
}

async fn stream_levels(mut socket: WebSocket, mut subscription: Subscription) {
    let recorder_id = subscription.recorder_id();
    debug!("Level observer {} attached to recorder {}", subscription.id(), recorder_id);

    let idle = sleep(KEEPALIVE);
    tokio::pin!(idle);

    loop {
        let sent = tokio::select! {
            event = subscription.next() => match event {
                Some(TelemetryEvent::Sample(sample)) => {
                    send_json(&mut socket, &LevelFrame::Levels(sample.as_ref())).await
                }
                Some(TelemetryEvent::End(reason)) => {
                    let _ = send_json(&mut socket, &LevelFrame::End { reason: &reason }).await;
                    break;
                }
                None => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) if is_ping(text.as_str()) => {
                    send_json(&mut socket, &LevelFrame::Pong).await
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
            _ = &mut idle => send_json(&mut socket, &LevelFrame::Keepalive).await,
        };
        if !sent {
            break;
        }
        idle.as_mut().reset(Instant::now() + KEEPALIVE);
    }

    debug!(
        "Level observer {} left recorder {} ({} samples dropped)",
        subscription.id(),
        recorder_id,
        subscription.dropped()
    );
    let _ = socket.send(Message::Close(None)).await;
}

pub async fn fleet_levels(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let fleet = state.fleet.clone();
    ws.on_upgrade(move |socket| stream_fleet_levels(socket, fleet))
}

/// Keepalive fires after a quiet period on the client side; level frames
/// do not reset it
async fn stream_fleet_levels(mut socket: WebSocket, fleet: Arc<Fleet>) {
    debug!("Fleet level observer attached");

    let mut ticks = interval(FLEET_FRAME_PERIOD);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle = sleep(KEEPALIVE);
    tokio::pin!(idle);

    loop {
        let sent = tokio::select! {
            _ = ticks.tick() => {
                let recorders = fleet.all_levels();
                let frame = FleetFrame::AllLevels {
                    at: Utc::now(),
                    recorders: &recorders,
                };
                send_json(&mut socket, &frame).await
            }
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    idle.as_mut().reset(Instant::now() + KEEPALIVE);
                    if is_ping(text.as_str()) {
                        send_json(&mut socket, &FleetFrame::Pong).await
                    } else {
                        true
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => true,
            },
            _ = &mut idle => {
                idle.as_mut().reset(Instant::now() + KEEPALIVE);
                send_json(&mut socket, &FleetFrame::Keepalive).await
            }
        };
        if !sent {
            break;
        }
    }

    debug!("Fleet level observer left");
    let _ = socket.send(Message::Close(None)).await;
}

pub async fn events(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.fleet.events();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(mut socket: WebSocket, mut events: broadcast::Receiver<FleetEvent>) {
    loop {
        let sent = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => send_json(&mut socket, &event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event observer lagged, {} events skipped", missed);
                    send_json(&mut socket, &EventFrame::Lagged { missed }).await
                }
                Err(RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) if is_ping(text.as_str()) => {
                    send_json(&mut socket, &EventFrame::Pong).await
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        if !sent {
            break;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
