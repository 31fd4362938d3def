use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::channels::{now_epoch_ms, Channel};
use crate::ffmpeg::{build_concat_plan, FfmpegSettings, OutputTarget};
use crate::metrics::SESSIONS_STARTED;
use crate::playback::PlaybackCache;
use crate::transcoder::Encoder;

/// Sessions that fail to produce bytes this many times inside the window get
/// their next resolve replaced with a throttle slate.
pub const MAX_ATTEMPTS: usize = 3;
pub const ATTEMPT_WINDOW_MS: i64 = 30_000;
/// Duration of the offline item substituted while throttling.
pub const THROTTLE_ITEM_MS: i64 = 60_000;

pub fn should_throttle(cache: &PlaybackCache, session: u64, now_ms: i64) -> bool {
    session != 0 && cache.failures_within(session, ATTEMPT_WINDOW_MS, now_ms) >= MAX_ATTEMPTS
}

/// Two entries pointing at the same `/stream` URL: the concat muxer reopens
/// the second one forever under `-stream_loop -1`, and every reopen re-enters
/// the controller at the then-current wall time. The first entry carries
/// `first=0` so the opening splice is the 40 ms loading item.
pub fn concat_manifest(
    base_url: &str,
    channel_number: u32,
    session: u64,
    audio_only: bool,
    hls: bool,
) -> String {
    let mut extra = String::new();
    if audio_only {
        extra.push_str("&audioOnly=1");
    }
    if hls {
        extra.push_str("&hls=1");
    }
    format!(
        "ffconcat version 1.0\n\
         file '{base_url}/stream?channel={channel_number}&session={session}&first=0{extra}'\n\
         file '{base_url}/stream?channel={channel_number}&session={session}{extra}'\n"
    )
}

/// Allocates per-process concat session identifiers.
pub struct SessionRegistry {
    next: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> u64 {
        SESSIONS_STARTED.inc();
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

struct HlsSession {
    dir: PathBuf,
    last_access: Arc<AtomicU64>,
    // Killed via Drop when the session is removed.
    _encoder: Encoder,
}

/// Per-channel HLS concat sessions: one outer encoder per channel writing a
/// rolling segment window into the configured directory. Idle sessions are
/// reaped after a grace period.
#[derive(Clone, Default)]
pub struct HlsSessions {
    inner: Arc<Mutex<HashMap<u32, HlsSession>>>,
}

const HLS_IDLE_GRACE_SECS: u64 = 60;

fn now_epoch_secs() -> u64 {
    (now_epoch_ms() / 1000) as u64
}

async fn clean_segment_dir(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            if name == "stream.m3u8" || (name.starts_with("seg_") && name.ends_with(".ts")) {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }
}

impl HlsSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the segment directory for the channel, starting the outer
    /// encoder if no live session exists.
    pub async fn ensure(
        &self,
        settings: &FfmpegSettings,
        registry: &SessionRegistry,
        base_url: &str,
        channel: &Channel,
    ) -> anyhow::Result<PathBuf> {
        let mut sessions = self.inner.lock().await;
        if let Some(existing) = sessions.get(&channel.number) {
            existing
                .last_access
                .store(now_epoch_secs(), Ordering::Relaxed);
            return Ok(existing.dir.clone());
        }

        let dir = PathBuf::from(&settings.hls.segment_dir).join(channel.number.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        clean_segment_dir(&dir).await;

        let session = registry.allocate();
        let playlist_url = format!(
            "{base_url}/playlist?channel={}&session={session}",
            channel.number
        );
        let args = build_concat_plan(
            settings,
            channel,
            &playlist_url,
            false,
            OutputTarget::Hls { dir: dir.clone() },
        );
        info!(
            "starting HLS session: channel={} session={} dir={}",
            channel.number,
            session,
            dir.display()
        );
        let (encoder, _rx) = Encoder::spawn(&settings.path, args, channel.number.to_string());

        let last_access = Arc::new(AtomicU64::new(now_epoch_secs()));
        sessions.insert(
            channel.number,
            HlsSession {
                dir: dir.clone(),
                last_access: last_access.clone(),
                _encoder: encoder,
            },
        );

        // Reap the session once nothing has touched the playlist for a while.
        let sessions_ref = self.inner.clone();
        let number = channel.number;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let last = last_access.load(Ordering::Relaxed);
                if now_epoch_secs().saturating_sub(last) >= HLS_IDLE_GRACE_SECS {
                    info!(
                        "HLS session idle for {}s, cleaning up: channel={}",
                        HLS_IDLE_GRACE_SECS, number
                    );
                    sessions_ref.lock().await.remove(&number);
                    break;
                }
            }
        });

        Ok(dir)
    }

    pub async fn touch(&self, channel_number: u32) {
        if let Some(session) = self.inner.lock().await.get(&channel_number) {
            session
                .last_access
                .store(now_epoch_secs(), Ordering::Relaxed);
        }
    }

    pub fn playlist_path(dir: &Path) -> PathBuf {
        dir.join("stream.m3u8")
    }

    /// Only `seg_*.ts` names resolve; anything path-like is rejected.
    pub fn segment_path(dir: &Path, name: &str) -> Option<PathBuf> {
        if !name.starts_with("seg_")
            || !name.ends_with(".ts")
            || name.contains('/')
            || name.contains("..")
        {
            return None;
        }
        Some(dir.join(name))
    }
}
