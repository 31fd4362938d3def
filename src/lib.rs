pub mod channels;
pub mod errors;
pub mod ffmpeg;
pub mod filler;
pub mod lineup;
pub mod metrics;
pub mod playback;
pub mod redirect;
pub mod session;
pub mod store;
pub mod transcoder;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{
    now_epoch_ms, Channel, LineupItem, OfflineSettings, StreamItem, StreamKind, SLACK_MS,
};
use crate::errors::StreamError;
use crate::ffmpeg::{
    build_concat_plan, build_plan, ErrorScreen, FfmpegSettings, OutputTarget, PlanRequest,
};
use crate::playback::PlaybackCache;
use crate::session::{concat_manifest, HlsSessions, SessionRegistry};
use crate::store::Store;
use crate::transcoder::{encoder_available, Encoder};

/// A channel whose whole lineup is one offline slot never comes back.
const PERMANENT_OFFLINE_MS: i64 = 365 * 24 * 60 * 60 * 1000;
/// Offline screens never run longer than this; the schedule may change.
const OFFLINE_SCREEN_CAP_MS: i64 = 10 * 60 * 1000;
/// Duration of the error slate substituted for unplayable content.
const ERROR_ITEM_MS: i64 = 60_000;

pub struct AppState {
    pub store: Store,
    pub playback: Arc<PlaybackCache>,
    pub sessions: SessionRegistry,
    pub hls: HlsSessions,
    pub settings: FfmpegSettings,
    pub base_url: String,
}

pub fn create_app(store: Store, settings: FfmpegSettings, base_url: String) -> Router {
    let state = Arc::new(AppState {
        store,
        playback: Arc::new(PlaybackCache::new()),
        sessions: SessionRegistry::new(),
        hls: HlsSessions::new(),
        settings,
        base_url,
    });

    Router::new()
        .route("/setup", get(setup_handler))
        .route("/video", get(video_handler))
        .route("/radio", get(radio_handler))
        .route("/stream", get(stream_handler))
        .route("/playlist", get(playlist_handler))
        .route("/m3u8", get(m3u8_handler))
        .route("/hls/{number}/{segment}", get(hls_segment_handler))
        .route("/media-player/playlist.m3u", get(guide_m3u_handler))
        .route("/media-player/{file}", get(media_player_handler))
        .route("/media-player/radio/{file}", get(media_player_radio_handler))
        .route("/api/channels", get(channels_api_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub channel: Option<String>,
    pub session: Option<u64>,
    #[serde(rename = "audioOnly")]
    pub audio_only: Option<String>,
    pub hls: Option<String>,
    pub m3u8: Option<String>,
    pub first: Option<i32>,
    pub fast: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("yes"))
}

async fn lookup_channel(store: &Store, raw: Option<&str>) -> Result<Channel, StreamError> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or(StreamError::BadRequest("channel"))?;
    if let Ok(number) = raw.parse::<u32>() {
        return store
            .channel_by_number(number)
            .await
            .ok_or_else(|| StreamError::NotFound(raw.to_string()));
    }
    if let Ok(id) = Uuid::parse_str(raw) {
        return store
            .channel_by_id(id)
            .await
            .ok_or_else(|| StreamError::NotFound(raw.to_string()));
    }
    Err(StreamError::BadRequest("channel"))
}

async fn require_encoder(state: &AppState) -> Result<(), StreamError> {
    if encoder_available(&state.settings.path).await {
        Ok(())
    } else {
        Err(StreamError::EncoderMissing(state.settings.path.clone()))
    }
}

/// Decides what one `/stream` invocation plays: resolves the lineup slot,
/// chases redirects, skips over sub-slack offline slivers, attaches filler to
/// offline gaps, and records playback history for cooldowns.
pub async fn prepare_stream_item(
    state: &AppState,
    origin: &Channel,
    mut now_ms: i64,
    is_first_join: bool,
    allow_skip: bool,
) -> Result<StreamItem, StreamError> {
    let max_depth = state.store.channel_count().await.max(1);

    for _ in 0..=max_depth {
        let lineup = state.store.lineup(origin.id).await;
        let resolved = redirect::walk(&state.store, origin, &lineup, now_ms).await?;
        if let Some(error) = resolved.error {
            return Ok(StreamItem::offline_with_error(
                redirect::CYCLE_ITEM_MS,
                error,
            ));
        }

        let final_channel = resolved.channel.clone();
        match resolved.slot.item.clone() {
            LineupItem::Content { program_id, .. } => {
                let Some(program) = state.store.program(program_id).await else {
                    return Ok(StreamItem::offline_with_error(
                        ERROR_ITEM_MS,
                        format!("Unknown program {program_id}"),
                    ));
                };
                let Some(path) = program.file_path.clone() else {
                    return Ok(StreamItem::offline_with_error(
                        ERROR_ITEM_MS,
                        format!("No source for {}", program.display_title()),
                    ));
                };
                state
                    .playback
                    .record_item(final_channel.number, &program.key.cache_key(), now_ms);
                return Ok(StreamItem {
                    kind: StreamKind::Program,
                    title: program.display_title(),
                    source: Some(path),
                    start_ms: resolved.slot.time_into_item_ms,
                    stream_duration_ms: resolved.stream_duration_ms,
                    beginning_offset_ms: resolved.slot.beginning_offset_ms,
                    duration_ms: program.duration_ms,
                    probe: program.probe.clone(),
                    error: None,
                });
            }
            LineupItem::Offline { .. } => {
                let remaining = resolved.stream_duration_ms;

                let final_lineup = if final_channel.id == origin.id {
                    lineup.clone()
                } else {
                    state.store.lineup(final_channel.id).await
                };
                if resolved.slot.index >= 0
                    && final_lineup.len() == 1
                    && final_lineup[0].is_offline()
                {
                    info!("channel {} is permanently offline", final_channel.number);
                    return Ok(StreamItem::offline(PERMANENT_OFFLINE_MS));
                }

                // A gap shorter than the slack is not worth a slate; hop over
                // it and resolve whatever airs next.
                if allow_skip && remaining <= SLACK_MS + 1 {
                    for hop in resolved.hops.iter().skip(1) {
                        state.playback.clear_channel(*hop);
                    }
                    now_ms += remaining + 1;
                    continue;
                }

                return Ok(offline_or_filler(
                    state,
                    &final_channel,
                    remaining,
                    is_first_join,
                    now_ms,
                )
                .await);
            }
            LineupItem::Redirect { .. } => {
                // The walker only ever hands back non-redirect slots.
                return Ok(StreamItem::offline_with_error(
                    ERROR_ITEM_MS,
                    "Unresolved redirect",
                ));
            }
        }
    }

    Ok(StreamItem::offline_with_error(
        ERROR_ITEM_MS,
        "Too many consecutive offline skips",
    ))
}

/// Offline slot handling: run the filler lottery; with no winner, shorten the
/// gap so the next resolve has candidates, and never slate longer than the cap.
async fn offline_or_filler(
    state: &AppState,
    channel: &Channel,
    remaining_ms: i64,
    is_first_join: bool,
    now_ms: i64,
) -> StreamItem {
    let mut shows = Vec::new();
    for collection in &channel.filler_collections {
        if let Some(show) = state.store.filler_show(collection.show_id).await {
            shows.push((collection.clone(), show));
        }
    }

    let outcome = {
        let mut rng = rand::thread_rng();
        filler::pick_filler(
            channel,
            &shows,
            &state.playback,
            remaining_ms,
            is_first_join,
            now_ms,
            &mut rng,
        )
    };

    if let Some(pick) = outcome.pick {
        if let Some(path) = pick.clip.file_path.clone() {
            if let Some(show_id) = pick.show_id {
                state
                    .playback
                    .record_filler_show(channel.number, show_id, now_ms);
            }
            state
                .playback
                .record_item(channel.number, &pick.clip.key.cache_key(), now_ms);
            return StreamItem {
                kind: StreamKind::Commercial,
                title: pick.clip.display_title(),
                source: Some(path),
                start_ms: pick.start_ms,
                stream_duration_ms: pick.clip.duration_ms - pick.start_ms,
                beginning_offset_ms: 0,
                duration_ms: pick.clip.duration_ms,
                probe: pick.clip.probe.clone(),
                error: None,
            };
        }
        warn!(
            "filler clip {} has no source, slating instead",
            pick.clip.display_title()
        );
    }

    let mut duration = remaining_ms;
    if outcome.minimum_wait_ms < duration {
        duration = outcome.minimum_wait_ms;
    }
    let mut item = StreamItem::offline(duration.clamp(1, OFFLINE_SCREEN_CAP_MS));
    item.title = channel.name.clone();
    item
}

/// Response body wrapper: meters throughput, kills the encoder when the
/// client goes away, and feeds the per-session failure window.
struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    encoder: Arc<Encoder>,
    playback: Arc<PlaybackCache>,
    session: u64,
    /// Set on the outer concat stream, whose disconnect retires the session.
    owns_session: bool,
    channel_label: String,
    produced_bytes: bool,
    last_log_time: std::time::Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.produced_bytes = true;
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= std::time::Duration::from_secs(5) {
                let rate = self.bytes_since_last_log as f64 / elapsed.as_secs_f64();
                metrics::CLIENT_BANDWIDTH
                    .with_label_values(&[&self.channel_label])
                    .set(rate);
                info!(
                    "stream bandwidth: channel={} rate={:.2} KB/s",
                    self.channel_label,
                    rate / 1024.0
                );
                self.last_log_time = std::time::Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        self.encoder.kill();
        metrics::ACTIVE_CLIENTS
            .with_label_values(&[&self.channel_label])
            .dec();
        metrics::CLIENT_BANDWIDTH
            .with_label_values(&[&self.channel_label])
            .set(0.0);
        if self.owns_session {
            self.playback.clear_session(self.session);
        } else if !self.produced_bytes {
            self.playback.record_failure(self.session, now_epoch_ms());
        }
        info!("client disconnected from channel {}", self.channel_label);
    }
}

fn stream_response(
    state: &AppState,
    channel_label: String,
    encoder: Encoder,
    rx: mpsc::Receiver<Bytes>,
    session: u64,
    owns_session: bool,
) -> Response {
    metrics::ACTIVE_CLIENTS
        .with_label_values(&[&channel_label])
        .inc();

    let byte_stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, std::io::Error>(bytes), rx))
    });

    let guarded = GuardedStream {
        inner: Box::pin(byte_stream),
        encoder: Arc::new(encoder),
        playback: state.playback.clone(),
        session,
        owns_session,
        channel_label,
        produced_bytes: false,
        last_log_time: std::time::Instant::now(),
        bytes_since_last_log: 0,
    };

    Response::builder()
        .header("Content-Type", "video/mp2t")
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded))
        .unwrap()
}

/// One program's worth of stream: resolve, build the encoder plan, pipe its
/// stdout to the client, EOF, and let the concat loop call back in.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let channel = lookup_channel(&state.store, q.channel.as_deref()).await?;
    require_encoder(&state).await?;

    let session = q.session.unwrap_or(0);
    let audio_only = flag(&q.audio_only);
    let now = now_epoch_ms();
    let is_first_join = q.session.is_none() || q.first == Some(1);

    let item = if q.first == Some(0) {
        StreamItem::loading()
    } else if session::should_throttle(&state.playback, session, now) {
        warn!(
            "session {} failing repeatedly on channel {}, throttling",
            session, channel.number
        );
        StreamItem::offline_with_error(session::THROTTLE_ITEM_MS, "Too many attempts, throttling")
    } else {
        prepare_stream_item(&state, &channel, now, is_first_join, true).await?
    };

    info!(
        "stream: channel={} session={} kind={:?} title=\"{}\" start={}ms duration={}ms audio_only={} hls={}",
        channel.number,
        session,
        item.kind,
        item.title,
        item.start_ms,
        item.stream_duration_ms,
        audio_only,
        flag(&q.hls) || flag(&q.m3u8),
    );

    let plan = build_plan(&PlanRequest {
        item: &item,
        channel: &channel,
        settings: &state.settings,
        audio_only,
        output: OutputTarget::Mpegts,
    })?;
    let (encoder, rx) = Encoder::spawn(&state.settings.path, plan, channel.number.to_string());
    Ok(stream_response(
        &state,
        channel.number.to_string(),
        encoder,
        rx,
        session,
        false,
    ))
}

/// The always-on channel stream: an outer concat encoder looping the
/// two-entry playlist, copying each per-item stream out as one mpegts.
async fn video_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    serve_concat(&state, &q, false).await
}

async fn radio_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    serve_concat(&state, &q, true).await
}

async fn serve_concat(
    state: &Arc<AppState>,
    q: &StreamQuery,
    audio_only: bool,
) -> Result<Response, StreamError> {
    let channel = lookup_channel(&state.store, q.channel.as_deref()).await?;
    require_encoder(state).await?;

    let session = state.sessions.allocate();
    let mut playlist_url = format!(
        "{}/playlist?channel={}&session={}",
        state.base_url, channel.number, session
    );
    if audio_only {
        playlist_url.push_str("&audioOnly=1");
    }
    info!(
        "concat session {} opened: channel={} audio_only={}",
        session, channel.number, audio_only
    );
    let args = build_concat_plan(
        &state.settings,
        &channel,
        &playlist_url,
        audio_only,
        OutputTarget::Mpegts,
    );
    let (encoder, rx) = Encoder::spawn(&state.settings.path, args, channel.number.to_string());
    Ok(stream_response(
        state,
        channel.number.to_string(),
        encoder,
        rx,
        session,
        true,
    ))
}

async fn playlist_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let channel = lookup_channel(&state.store, q.channel.as_deref()).await?;
    let session = match q.session {
        Some(session) => session,
        None => state.sessions.allocate(),
    };
    let manifest = concat_manifest(
        &state.base_url,
        channel.number,
        session,
        flag(&q.audio_only),
        flag(&q.hls),
    );
    Ok(Response::builder()
        .header("Content-Type", "text/plain")
        .header("Cache-Control", "no-store")
        .body(Body::from(manifest))
        .unwrap())
}

/// Static slate for installations with no channels configured yet.
async fn setup_handler(State(state): State<Arc<AppState>>) -> Result<Response, StreamError> {
    require_encoder(&state).await?;

    let placeholder = Channel {
        id: Uuid::nil(),
        number: 0,
        name: "loopcast".into(),
        group_title: String::new(),
        start_time_ms: 0,
        duration_ms: OFFLINE_SCREEN_CAP_MS,
        icon: None,
        watermark: None,
        offline: OfflineSettings::default(),
        transcoding: None,
        stealth: true,
        filler_collections: Vec::new(),
        filler_repeat_cooldown_ms: 0,
        disable_filler_overlay: false,
    };
    let mut item =
        StreamItem::offline_with_error(OFFLINE_SCREEN_CAP_MS, "No channels configured");
    item.title = "loopcast".into();

    // The slate must render even when the operator configured pic/kill modes.
    let mut settings = state.settings.clone();
    settings.error_screen = ErrorScreen::Text;

    let plan = build_plan(&PlanRequest {
        item: &item,
        channel: &placeholder,
        settings: &settings,
        audio_only: false,
        output: OutputTarget::Mpegts,
    })?;
    let (encoder, rx) = Encoder::spawn(&settings.path, plan, "setup".to_string());
    Ok(stream_response(
        &state,
        "setup".to_string(),
        encoder,
        rx,
        0,
        false,
    ))
}

/// Manifest-driven mode: keep a per-channel HLS session alive and serve its
/// playlist, rewriting segment names onto our `/hls` route.
async fn m3u8_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let channel = lookup_channel(&state.store, q.channel.as_deref()).await?;
    require_encoder(&state).await?;

    let dir = state
        .hls
        .ensure(&state.settings, &state.sessions, &state.base_url, &channel)
        .await
        .map_err(|e| {
            warn!(
                "failed to start HLS session: channel={} err={}",
                channel.number, e
            );
            StreamError::EncoderMissing(state.settings.path.clone())
        })?;
    state.hls.touch(channel.number).await;

    // The playlist takes a few seconds to appear on a cold start; wait
    // briefly and serve whatever is there rather than stalling the player.
    let playlist_path = HlsSessions::playlist_path(&dir);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(4);
    let mut bytes: Option<Vec<u8>> = None;
    while std::time::Instant::now() < deadline {
        match tokio::fs::read(&playlist_path).await {
            Ok(data) if data.windows(4).any(|w| w == b"seg_") => {
                bytes = Some(data);
                break;
            }
            Ok(data) => bytes = Some(data),
            Err(_) => {}
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    match bytes {
        Some(data) => {
            let text = String::from_utf8_lossy(&data);
            let rewritten = text
                .lines()
                .map(|line| {
                    if line.starts_with("seg_") && line.ends_with(".ts") {
                        format!("/hls/{}/{}", channel.number, line)
                    } else {
                        line.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
                + "\n";
            Ok(Response::builder()
                .header("Content-Type", "application/x-mpegURL")
                .header("Cache-Control", "no-cache")
                .body(Body::from(rewritten))
                .unwrap())
        }
        None => {
            warn!("HLS playlist not ready: channel={}", channel.number);
            Ok(Response::builder()
                .status(503)
                .header("Retry-After", "1")
                .header("Cache-Control", "no-cache")
                .body(Body::from("HLS not ready"))
                .unwrap())
        }
    }
}

async fn hls_segment_handler(
    State(state): State<Arc<AppState>>,
    UrlPath((number, segment)): UrlPath<(u32, String)>,
) -> Response {
    let dir = PathBuf::from(&state.settings.hls.segment_dir).join(number.to_string());
    let Some(path) = HlsSessions::segment_path(&dir, &segment) else {
        return Response::builder()
            .status(400)
            .body(Body::from("Invalid segment"))
            .unwrap();
    };
    state.hls.touch(number).await;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .header("Content-Type", "video/mp2t")
            .header("Cache-Control", "no-store")
            .body(Body::from(bytes))
            .unwrap(),
        Err(_) => Response::builder()
            .status(404)
            .body(Body::from("Segment not found"))
            .unwrap(),
    }
}

fn extinf_line(base_url: &str, channel: &Channel, target: &str) -> String {
    format!(
        "#EXTINF:-1 tvg-id=\"{id}\" tvg-chno=\"{number}\" tvg-name=\"{name}\" tvg-logo=\"{logo}\" group-title=\"{group}\", {name}\n{base_url}{target}?channel={number}\n",
        id = channel.id,
        number = channel.number,
        name = channel.name,
        logo = channel.icon.as_deref().unwrap_or(""),
        group = channel.group_title,
    )
}

fn parse_m3u_file_name(file: &str) -> Option<u32> {
    file.strip_suffix(".m3u")?.parse().ok()
}

async fn media_player_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(file): UrlPath<String>,
    Query(q): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let number = parse_m3u_file_name(&file).ok_or(StreamError::BadRequest("channel"))?;
    let channel = lookup_channel(&state.store, Some(&number.to_string())).await?;
    let target = if flag(&q.fast) { "/m3u8" } else { "/video" };
    let body = format!("#EXTM3U\n{}", extinf_line(&state.base_url, &channel, target));
    Ok(m3u_response(body))
}

async fn media_player_radio_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(file): UrlPath<String>,
) -> Result<Response, StreamError> {
    let number = parse_m3u_file_name(&file).ok_or(StreamError::BadRequest("channel"))?;
    let channel = lookup_channel(&state.store, Some(&number.to_string())).await?;
    let body = format!("#EXTM3U\n{}", extinf_line(&state.base_url, &channel, "/radio"));
    Ok(m3u_response(body))
}

/// Full guide: every non-stealth channel, one entry each.
async fn guide_m3u_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut body = String::from("#EXTM3U\n");
    for channel in state.store.channels().await {
        if channel.stealth {
            continue;
        }
        body.push_str(&extinf_line(&state.base_url, &channel, "/video"));
    }
    m3u_response(body)
}

fn m3u_response(body: String) -> Response {
    Response::builder()
        .header("Content-Type", "video/x-mpegurl")
        .header("Cache-Control", "no-cache")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug, Serialize)]
struct ChannelSummary {
    number: u32,
    name: String,
    group_title: String,
    icon: Option<String>,
}

async fn channels_api_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelSummary>> {
    let channels = state
        .store
        .channels()
        .await
        .into_iter()
        .filter(|c| !c.stealth)
        .map(|c| ChannelSummary {
            number: c.number,
            name: c.name,
            group_title: c.group_title,
            icon: c.icon,
        })
        .collect();
    Json(channels)
}

async fn metrics_handler() -> Response {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap()
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}
