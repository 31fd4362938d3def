use serde::Deserialize;
use std::path::PathBuf;

use crate::channels::{
    Channel, ProbeStats, ScanType, StreamItem, StreamKind, Watermark, WatermarkPosition,
};
use crate::errors::StreamError;

/// Global encoder configuration, `[ffmpeg]` in the config file. Resolution,
/// bitrate and buffer are layered: built-in default, then this section, then
/// the per-channel override.
#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegSettings {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_threads")]
    pub threads: u8,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub video_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub video_buffer_kb: Option<u32>,
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,
    #[serde(default = "default_video_encoder")]
    pub video_encoder: String,
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u8,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    #[serde(default = "default_true")]
    pub normalize_video_codec: bool,
    #[serde(default = "default_true")]
    pub normalize_audio_codec: bool,
    #[serde(default = "default_true")]
    pub normalize_resolution: bool,
    /// Channel-count/sample-rate normalisation. Independent of
    /// `normalize_audio_codec`; either alone forces an audio transcode.
    #[serde(default = "default_true")]
    pub normalize_audio: bool,
    #[serde(default = "default_deinterlace")]
    pub deinterlace_filter: String,
    #[serde(default)]
    pub error_screen: ErrorScreen,
    #[serde(default)]
    pub error_audio: ErrorAudio,
    #[serde(default)]
    pub error_picture: Option<String>,
    #[serde(default = "default_volume")]
    pub volume_percent: u32,
    #[serde(default)]
    pub apad: bool,
    #[serde(default)]
    pub hls: HlsSettings,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        FfmpegSettings {
            path: default_path(),
            threads: default_threads(),
            log_level: default_log_level(),
            resolution: None,
            video_bitrate_kbps: None,
            video_buffer_kb: None,
            max_fps: default_max_fps(),
            video_encoder: default_video_encoder(),
            audio_encoder: default_audio_encoder(),
            audio_bitrate_kbps: default_audio_bitrate(),
            audio_channels: default_audio_channels(),
            audio_sample_rate: default_audio_sample_rate(),
            normalize_video_codec: true,
            normalize_audio_codec: true,
            normalize_resolution: true,
            normalize_audio: true,
            deinterlace_filter: default_deinterlace(),
            error_screen: ErrorScreen::default(),
            error_audio: ErrorAudio::default(),
            error_picture: None,
            volume_percent: default_volume(),
            apad: false,
            hls: HlsSettings::default(),
        }
    }
}

fn default_path() -> String {
    "/usr/bin/ffmpeg".to_string()
}
fn default_threads() -> u8 {
    2
}
fn default_log_level() -> String {
    "error".to_string()
}
fn default_max_fps() -> f64 {
    60.0
}
fn default_video_encoder() -> String {
    "libx264".to_string()
}
fn default_audio_encoder() -> String {
    "aac".to_string()
}
fn default_audio_bitrate() -> u32 {
    192
}
fn default_audio_channels() -> u8 {
    2
}
fn default_audio_sample_rate() -> u32 {
    48_000
}
fn default_true() -> bool {
    true
}
fn default_deinterlace() -> String {
    "none".to_string()
}
fn default_volume() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScreen {
    #[default]
    Pic,
    Static,
    Testsrc,
    Text,
    /// Refuse the request instead of synthesizing anything.
    Kill,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAudio {
    #[default]
    Silent,
    Sine,
    Whitenoise,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsSettings {
    #[serde(default = "default_segment_dir")]
    pub segment_dir: String,
    #[serde(default = "default_hls_time")]
    pub hls_time_secs: u32,
    #[serde(default = "default_hls_list_size")]
    pub hls_list_size: u32,
    #[serde(default = "default_hls_delete_threshold")]
    pub hls_delete_threshold: u32,
}

impl Default for HlsSettings {
    fn default() -> Self {
        HlsSettings {
            segment_dir: default_segment_dir(),
            hls_time_secs: default_hls_time(),
            hls_list_size: default_hls_list_size(),
            hls_delete_threshold: default_hls_delete_threshold(),
        }
    }
}

fn default_segment_dir() -> String {
    "/tmp/loopcast-hls".to_string()
}
fn default_hls_time() -> u32 {
    2
}
fn default_hls_list_size() -> u32 {
    10
}
fn default_hls_delete_threshold() -> u32 {
    3
}

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_VIDEO_BITRATE_KBPS: u32 = 10_000;
pub const DEFAULT_VIDEO_BUFFER_KB: u32 = 2_048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub video_buffer_kb: u32,
}

/// Built-in defaults, overlaid by the `[ffmpeg]` section, overlaid by the
/// channel's transcoding overrides. Each recognised option merges
/// independently.
pub fn resolve_transcode_options(settings: &FfmpegSettings, channel: &Channel) -> TranscodeOptions {
    let mut width = DEFAULT_WIDTH;
    let mut height = DEFAULT_HEIGHT;
    let mut bitrate = DEFAULT_VIDEO_BITRATE_KBPS;
    let mut buffer = DEFAULT_VIDEO_BUFFER_KB;

    if let Some((w, h)) = settings.resolution.as_deref().and_then(parse_resolution) {
        width = w;
        height = h;
    }
    if let Some(b) = settings.video_bitrate_kbps {
        bitrate = b;
    }
    if let Some(b) = settings.video_buffer_kb {
        buffer = b;
    }

    if let Some(overrides) = &channel.transcoding {
        if let Some((w, h)) = overrides.resolution.as_deref().and_then(parse_resolution) {
            width = w;
            height = h;
        }
        if let Some(b) = overrides.video_bitrate_kbps {
            bitrate = b;
        }
        if let Some(b) = overrides.video_buffer_kb {
            buffer = b;
        }
    }

    TranscodeOptions {
        width,
        height,
        video_bitrate_kbps: bitrate,
        video_buffer_kb: buffer,
    }
}

pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Transport stream on stdout, served straight to the client.
    Mpegts,
    Hls { dir: PathBuf },
    Dash { dir: PathBuf },
}

pub struct PlanRequest<'a> {
    pub item: &'a StreamItem,
    pub channel: &'a Channel,
    pub settings: &'a FfmpegSettings,
    pub audio_only: bool,
    pub output: OutputTarget,
}

/// Named-pad filter chain. Every step consumes the current cursor pad and
/// defines a fresh one, so the rendered graph never starts with `;` and no
/// pad is defined twice.
struct FilterGraph {
    steps: Vec<String>,
    video: String,
    audio: String,
    video_filtered: bool,
    audio_filtered: bool,
    next_pad: u32,
}

impl FilterGraph {
    fn new(video_in: impl Into<String>, audio_in: impl Into<String>) -> Self {
        FilterGraph {
            steps: Vec::new(),
            video: video_in.into(),
            audio: audio_in.into(),
            video_filtered: false,
            audio_filtered: false,
            next_pad: 0,
        }
    }

    fn fresh_pad(&mut self) -> String {
        let pad = format!("p{}", self.next_pad);
        self.next_pad += 1;
        pad
    }

    fn push_video(&mut self, filter: impl AsRef<str>) {
        let out = self.fresh_pad();
        self.steps
            .push(format!("[{}]{}[{}]", self.video, filter.as_ref(), out));
        self.video = out;
        self.video_filtered = true;
    }

    fn push_audio(&mut self, filter: impl AsRef<str>) {
        let out = self.fresh_pad();
        self.steps
            .push(format!("[{}]{}[{}]", self.audio, filter.as_ref(), out));
        self.audio = out;
        self.audio_filtered = true;
    }

    /// Two-input step: current video plus `other` (e.g. a watermark pad).
    fn push_overlay(&mut self, other: &str, filter: impl AsRef<str>) {
        let out = self.fresh_pad();
        self.steps.push(format!(
            "[{}][{}]{}[{}]",
            self.video,
            other,
            filter.as_ref(),
            out
        ));
        self.video = out;
        self.video_filtered = true;
    }

    /// Side chain that does not move the cursors (watermark pre-scaling).
    fn push_side(&mut self, input: &str, filter: impl AsRef<str>) -> String {
        let out = self.fresh_pad();
        self.steps
            .push(format!("[{}]{}[{}]", input, filter.as_ref(), out));
        out
    }

    fn render(&self) -> Option<String> {
        if self.steps.is_empty() {
            None
        } else {
            Some(self.steps.join(";"))
        }
    }

    fn video_map(&self) -> String {
        if self.video_filtered {
            format!("[{}]", self.video)
        } else {
            self.video.clone()
        }
    }

    fn audio_map(&self) -> String {
        if self.audio_filtered {
            format!("[{}]", self.audio)
        } else {
            self.audio.clone()
        }
    }
}

/// Builds the full encoder invocation for one resolved item. Pure: identical
/// inputs produce byte-identical arglists.
pub fn build_plan(req: &PlanRequest) -> Result<Vec<String>, StreamError> {
    let opts = resolve_transcode_options(req.settings, req.channel);
    let mut args = global_args(req.settings);

    match req.item.kind {
        StreamKind::Program | StreamKind::Commercial if req.item.source.is_some() => {
            content_plan(req, &opts, &mut args)?;
        }
        _ => synthetic_plan(req, &opts, &mut args)?,
    }

    if req.item.stream_duration_ms > 0 {
        args.push("-t".into());
        args.push(fmt_secs(req.item.stream_duration_ms));
    }
    push_metadata(&mut args, &req.channel.name);
    push_output(&mut args, req.settings, &req.output);
    Ok(args)
}

fn global_args(settings: &FfmpegSettings) -> Vec<String> {
    vec![
        "-threads".into(),
        settings.threads.to_string(),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        settings.log_level.clone(),
        "-fflags".into(),
        "+genpts+discardcorrupt".into(),
    ]
}

fn push_metadata(args: &mut Vec<String>, channel_name: &str) {
    args.push("-metadata".into());
    args.push("service_provider=loopcast".into());
    args.push("-metadata".into());
    args.push(format!("service_name={channel_name}"));
}

fn push_output(args: &mut Vec<String>, settings: &FfmpegSettings, output: &OutputTarget) {
    match output {
        OutputTarget::Mpegts => {
            args.extend(
                ["-muxdelay", "0", "-muxpreload", "0", "-f", "mpegts", "pipe:1"]
                    .map(String::from),
            );
        }
        OutputTarget::Hls { dir } => {
            args.extend([
                "-f".into(),
                "hls".into(),
                "-hls_time".into(),
                settings.hls.hls_time_secs.to_string(),
                "-hls_list_size".into(),
                settings.hls.hls_list_size.to_string(),
                "-hls_delete_threshold".into(),
                settings.hls.hls_delete_threshold.to_string(),
                "-hls_flags".into(),
                "delete_segments+independent_segments+omit_endlist".into(),
                "-hls_segment_filename".into(),
                dir.join("seg_%05d.ts").to_string_lossy().into_owned(),
                dir.join("stream.m3u8").to_string_lossy().into_owned(),
            ]);
        }
        OutputTarget::Dash { dir } => {
            args.extend([
                "-f".into(),
                "dash".into(),
                "-seg_duration".into(),
                settings.hls.hls_time_secs.to_string(),
                "-window_size".into(),
                settings.hls.hls_list_size.to_string(),
                dir.join("stream.mpd").to_string_lossy().into_owned(),
            ]);
        }
    }
}

fn content_plan(
    req: &PlanRequest,
    opts: &TranscodeOptions,
    args: &mut Vec<String>,
) -> Result<(), StreamError> {
    let settings = req.settings;
    let item = req.item;
    let source = item.source.as_deref().unwrap_or_default();
    let default_probe = ProbeStats {
        width: opts.width,
        height: opts.height,
        sar_num: 1,
        sar_den: 1,
        fps: 0.0,
        scan_type: ScanType::Progressive,
        video_codec: String::new(),
        audio_codec: String::new(),
        audio_index: None,
        audio_only: false,
    };
    let probe = item.probe.as_ref().unwrap_or(&default_probe);
    let audio_only = req.audio_only || probe.audio_only;

    if item.start_ms > 0 {
        args.push("-ss".into());
        args.push(fmt_secs(item.start_ms));
    }
    args.push("-re".into());
    args.push("-i".into());
    args.push(source.to_string());

    let watermark = active_watermark(req, audio_only);
    if let Some(mark) = watermark {
        if mark.animated {
            args.push("-ignore_loop".into());
            args.push("0".into());
        }
        args.push("-i".into());
        args.push(mark.url.clone().unwrap_or_default());
    }

    // Codec-family decision: copy unless normalisation asks for a transcode.
    // Unknown pairings transcode.
    let codec_transcode_video = settings.normalize_video_codec
        && !video_codec_matches(&probe.video_codec, &settings.video_encoder);
    let codec_transcode_audio = settings.normalize_audio_codec
        && !audio_codec_matches(&probe.audio_codec, &settings.audio_encoder);

    let fps_cap = probe.fps > settings.max_fps + 1e-6;
    let deinterlace =
        probe.scan_type == ScanType::Interlaced && settings.deinterlace_filter != "none";

    let (fit_w, fit_h) = fit_resolution(
        probe.width,
        probe.height,
        probe.sar_num,
        probe.sar_den,
        opts.width,
        opts.height,
    );
    let (scale_to, pad_to) = if audio_only {
        (None, None)
    } else if settings.normalize_resolution {
        let scale = ((probe.width, probe.height) != (fit_w, fit_h)).then_some((fit_w, fit_h));
        let pad = ((fit_w, fit_h) != (opts.width, opts.height))
            .then_some((opts.width, opts.height));
        (scale, pad)
    } else if codec_transcode_video && (probe.width > opts.width || probe.height > opts.height) {
        // Normalisation is off: only tame oversized sources, and keep the
        // encoder happy by padding odd dimensions up to even.
        let pad = (fit_w % 2 == 1 || fit_h % 2 == 1).then_some((0, 0));
        (Some((fit_w, fit_h)), pad)
    } else {
        (None, None)
    };

    let audio_in = match probe.audio_index {
        Some(idx) => format!("0:{idx}"),
        None => "0:a:0".to_string(),
    };
    let mut graph = FilterGraph::new("0:v:0", audio_in);

    if !audio_only {
        if fps_cap {
            graph.push_video(format!("fps={}", fmt_f64(settings.max_fps)));
        }
        if deinterlace {
            graph.push_video(&settings.deinterlace_filter);
        }
        if let Some((w, h)) = scale_to {
            graph.push_video(format!("scale={w}:{h}"));
        }
        match pad_to {
            Some((0, 0)) => graph.push_video("pad=ceil(iw/2)*2:ceil(ih/2)*2"),
            Some((w, h)) => graph.push_video(format!("pad={w}:{h}:(ow-iw)/2:(oh-ih)/2")),
            None => {}
        }
        if scale_to.is_some() || pad_to.is_some() {
            graph.push_video("setsar=1");
        }
        if let Some(mark) = watermark {
            let pad = if mark.fixed_size {
                "1:v".to_string()
            } else {
                let width = ((opts.width as f64) * mark.width_percent / 100.0).round() as u32;
                graph.push_side("1:v", format!("scale={width}:-1"))
            };
            graph.push_overlay(&pad, overlay_filter(mark));
        }
    }

    if settings.normalize_audio {
        graph.push_audio(format!("aresample={}", settings.audio_sample_rate));
    }
    if settings.volume_percent != 100 {
        graph.push_audio(volume_filter(settings.volume_percent));
    }
    if settings.apad && !audio_only {
        graph.push_audio(format!("apad=whole_dur={}ms", item.stream_duration_ms));
    }

    let transcode_video = codec_transcode_video || graph.video_filtered;
    let transcode_audio = codec_transcode_audio || graph.audio_filtered;

    if let Some(complex) = graph.render() {
        args.push("-filter_complex".into());
        args.push(complex);
    }

    if !audio_only {
        args.push("-map".into());
        args.push(graph.video_map());
        push_video_codec(args, settings, opts, transcode_video, false);
    }
    args.push("-map".into());
    if graph.audio_filtered {
        args.push(graph.audio_map());
    } else if probe.audio_index.is_some() {
        args.push(graph.audio_map());
    } else {
        // Tolerate sources without an audio track when copying straight through.
        args.push("0:a:0?".into());
    }
    push_audio_codec(args, settings, transcode_audio);
    args.push("-sn".into());
    args.push("-dn".into());
    Ok(())
}

/// Screens generated without a real input: offline slots, error slates, and
/// the 40 ms loading splice.
fn synthetic_plan(
    req: &PlanRequest,
    opts: &TranscodeOptions,
    args: &mut Vec<String>,
) -> Result<(), StreamError> {
    let settings = req.settings;
    let item = req.item;
    let (w, h) = (opts.width, opts.height);
    let duration = fmt_secs(item.stream_duration_ms.max(1));

    enum Screen {
        Blank,
        Pic(String),
        Static,
        Testsrc,
        Text,
    }

    let screen = match item.kind {
        StreamKind::Loading => Screen::Blank,
        StreamKind::Offline => match req
            .channel
            .offline
            .picture
            .clone()
            .or_else(|| settings.error_picture.clone())
        {
            Some(picture) => Screen::Pic(picture),
            None => Screen::Text,
        },
        _ => match settings.error_screen {
            ErrorScreen::Kill => return Err(StreamError::EncoderRefused),
            ErrorScreen::Pic => match settings.error_picture.clone() {
                Some(picture) => Screen::Pic(picture),
                None => Screen::Text,
            },
            ErrorScreen::Static => Screen::Static,
            ErrorScreen::Testsrc => Screen::Testsrc,
            ErrorScreen::Text => Screen::Text,
        },
    };

    let audio_only = req.audio_only;
    let mut stillimage = false;
    // Without a video input the audio bed is input 0, otherwise input 1.
    let mut graph = if audio_only {
        FilterGraph::new("0:v:0", "0:a:0")
    } else {
        FilterGraph::new("0:v:0", "1:a:0")
    };

    if !audio_only {
        match &screen {
            Screen::Blank => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(format!("color=c=black:s={w}x{h}:d={duration}"));
                graph.push_video("realtime");
            }
            Screen::Pic(picture) => {
                args.push("-i".into());
                args.push(picture.clone());
                graph.push_video("format=yuv420p");
                graph.push_video(format!("scale={w}:{h}:force_original_aspect_ratio=1"));
                graph.push_video(format!("pad={w}:{h}:(ow-iw)/2:(oh-ih)/2"));
                graph.push_video("loop=loop=-1:size=1:start=0");
                graph.push_video("realtime");
                stillimage = stillimage_supported(&settings.video_encoder);
            }
            Screen::Static => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(format!("nullsrc=s={w}x{h}"));
                graph.push_video("geq=random(1)*255:128:128");
                graph.push_video(format!("scale={w}:{h}"));
                graph.push_video("realtime");
            }
            Screen::Testsrc => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(format!("testsrc=size={w}x{h}"));
                graph.push_video("realtime");
            }
            Screen::Text => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(format!("color=c=black:s={w}x{h}:d={duration}"));
                let title_size = (h as f64 / 22.0).ceil() as u32;
                let subtitle_size = (h as f64 / 33.0).ceil() as u32;
                let title = drawtext_escape(&item.title);
                let subtitle = drawtext_escape(item.error.as_deref().unwrap_or(""));
                graph.push_video(format!(
                    "drawtext=font=sans:fontsize={title_size}:fontcolor=white:\
                     x=(w-text_w)/2:y=(h-text_h)/2-{subtitle_size}:text='{title}'"
                ));
                if !subtitle.is_empty() {
                    graph.push_video(format!(
                        "drawtext=font=sans:fontsize={subtitle_size}:fontcolor=white:\
                         x=(w-text_w)/2:y=(h-text_h)/2+{subtitle_size}:text='{subtitle}'"
                    ));
                }
                graph.push_video("realtime");
            }
        }
    }

    // Synthetic audio bed. Offline slots loop the channel soundtrack when one
    // is configured; error slates follow the configured error audio.
    let mut volume = settings.volume_percent;
    let soundtrack = match item.kind {
        StreamKind::Offline => req.channel.offline.soundtrack.clone(),
        _ => None,
    };
    match (&soundtrack, item.kind) {
        (Some(track), _) => {
            args.push("-i".into());
            args.push(track.clone());
            graph.push_audio("aloop=loop=-1:size=2147483647");
        }
        (None, StreamKind::Loading) => {
            args.push("-f".into());
            args.push("lavfi".into());
            args.push("-i".into());
            args.push(format!("aevalsrc=0:duration={duration}"));
        }
        (None, _) => {
            let bed = if audio_only {
                volume = volume.min(70);
                format!("aevalsrc=random(0):duration={duration}")
            } else {
                match settings.error_audio {
                    ErrorAudio::Sine => {
                        volume = volume.min(70);
                        format!("sine=f=440:duration={duration}")
                    }
                    ErrorAudio::Whitenoise => {
                        volume = volume.min(70);
                        format!("aevalsrc=random(0):duration={duration}")
                    }
                    ErrorAudio::Silent => format!("aevalsrc=0:duration={duration}"),
                }
            };
            args.push("-f".into());
            args.push("lavfi".into());
            args.push("-i".into());
            args.push(bed);
        }
    }
    if volume != 100 {
        graph.push_audio(volume_filter(volume));
    }

    if let Some(complex) = graph.render() {
        args.push("-filter_complex".into());
        args.push(complex);
    }
    if !audio_only {
        args.push("-map".into());
        args.push(graph.video_map());
        push_video_codec(args, settings, opts, true, stillimage);
    }
    args.push("-map".into());
    args.push(graph.audio_map());
    push_audio_codec(args, settings, true);
    Ok(())
}

fn active_watermark<'a>(req: &'a PlanRequest, audio_only: bool) -> Option<&'a Watermark> {
    if audio_only {
        return None;
    }
    let mark = req.channel.watermark.as_ref()?;
    if !mark.enabled || mark.url.is_none() {
        return None;
    }
    match req.item.kind {
        StreamKind::Program => Some(mark),
        StreamKind::Commercial if !req.channel.disable_filler_overlay => Some(mark),
        _ => None,
    }
}

fn overlay_filter(mark: &Watermark) -> String {
    let hm = format!("{:.4}", mark.horizontal_margin_percent / 100.0);
    let vm = format!("{:.4}", mark.vertical_margin_percent / 100.0);
    let (x, y) = match mark.position {
        WatermarkPosition::TopLeft => (format!("W*{hm}"), format!("H*{vm}")),
        WatermarkPosition::TopRight => (format!("W-w-W*{hm}"), format!("H*{vm}")),
        WatermarkPosition::BottomLeft => (format!("W*{hm}"), format!("H-h-H*{vm}")),
        WatermarkPosition::BottomRight => (format!("W-w-W*{hm}"), format!("H-h-H*{vm}")),
    };
    let shortest = if mark.animated { "shortest=1:" } else { "" };
    let enable = if mark.duration_secs > 0 {
        format!(":enable='between(t,0,{})'", mark.duration_secs)
    } else {
        String::new()
    };
    format!("overlay={shortest}x={x}:y={y}{enable}")
}

fn volume_filter(percent: u32) -> String {
    format!("volume={:.2}", percent as f64 / 100.0)
}

fn push_video_codec(
    args: &mut Vec<String>,
    settings: &FfmpegSettings,
    opts: &TranscodeOptions,
    transcode: bool,
    stillimage: bool,
) {
    if !transcode {
        args.push("-c:v".into());
        args.push("copy".into());
        return;
    }
    args.push("-c:v".into());
    args.push(settings.video_encoder.clone());
    if stillimage {
        args.push("-tune".into());
        args.push("stillimage".into());
    }
    args.extend([
        "-b:v".into(),
        format!("{}k", opts.video_bitrate_kbps),
        "-maxrate:v".into(),
        format!("{}k", opts.video_bitrate_kbps),
        "-bufsize:v".into(),
        format!("{}k", opts.video_buffer_kb),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-max_muxing_queue_size".into(),
        "1024".into(),
    ]);
}

fn push_audio_codec(args: &mut Vec<String>, settings: &FfmpegSettings, transcode: bool) {
    if !transcode {
        args.push("-c:a".into());
        args.push("copy".into());
        return;
    }
    args.extend([
        "-c:a".into(),
        settings.audio_encoder.clone(),
        "-b:a".into(),
        format!("{}k", settings.audio_bitrate_kbps),
    ]);
    if settings.normalize_audio {
        args.extend([
            "-ac".into(),
            settings.audio_channels.to_string(),
            "-ar".into(),
            settings.audio_sample_rate.to_string(),
        ]);
    }
}

/// The outer concat loop: reads the two-entry ffconcat playlist forever and
/// copies whatever the per-item invocations emit.
pub fn build_concat_plan(
    settings: &FfmpegSettings,
    channel: &Channel,
    playlist_url: &str,
    audio_only: bool,
    output: OutputTarget,
) -> Vec<String> {
    let mut args = vec![
        "-threads".into(),
        "1".into(),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        settings.log_level.clone(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-protocol_whitelist".into(),
        "file,http,https,tcp,tls".into(),
        "-probesize".into(),
        "32".into(),
        "-stream_loop".into(),
        "-1".into(),
        "-i".into(),
        playlist_url.to_string(),
    ];
    if audio_only {
        args.push("-map".into());
        args.push("0:a".into());
    } else {
        args.push("-map".into());
        args.push("0:v".into());
        args.push("-map".into());
        args.push("0:a?".into());
    }
    args.extend([
        "-c".into(),
        "copy".into(),
        "-muxdelay".into(),
        "0".into(),
        "-muxpreload".into(),
        "0".into(),
    ]);
    push_metadata(&mut args, &channel.name);
    push_output(&mut args, settings, &output);
    args
}

fn stillimage_supported(encoder: &str) -> bool {
    matches!(encoder, "mpeg2video" | "libx264" | "h264_videotoolbox")
}

fn video_family(codec: &str) -> Option<&'static str> {
    let c = codec.to_ascii_lowercase();
    if c.contains("264") {
        Some("h264")
    } else if c.contains("265") || c.contains("hevc") {
        Some("hevc")
    } else if c.contains("mpeg2") {
        Some("mpeg2")
    } else {
        None
    }
}

fn video_codec_matches(probed: &str, encoder: &str) -> bool {
    match (video_family(probed), video_family(encoder)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn audio_family(codec: &str) -> Option<&'static str> {
    let c = codec.to_ascii_lowercase();
    if c.contains("mp3") || c.contains("lame") {
        Some("mp3")
    } else if c.contains("aac") {
        Some("aac")
    } else if c.contains("ac3") {
        Some("ac3")
    } else if c.contains("flac") {
        Some("flac")
    } else {
        None
    }
}

fn audio_codec_matches(probed: &str, encoder: &str) -> bool {
    match (audio_family(probed), audio_family(encoder)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Aspect-corrected fit: reduce `(w·sar_num, h·sar_den)` by gcd, then scale
/// to the largest size with that aspect inside the wanted box.
pub fn fit_resolution(
    width: u32,
    height: u32,
    sar_num: u32,
    sar_den: u32,
    want_w: u32,
    want_h: u32,
) -> (u32, u32) {
    let mut p = width as u64 * sar_num.max(1) as u64;
    let mut q = height as u64 * sar_den.max(1) as u64;
    if p == 0 || q == 0 {
        return (want_w, want_h);
    }
    let g = gcd(p, q);
    p /= g;
    q /= g;
    if want_w as u64 * q <= want_h as u64 * p {
        let w = want_w as u64;
        ((w) as u32, ((w * q + p / 2) / p) as u32)
    } else {
        let h = want_h as u64;
        (((h * p + q / 2) / q) as u32, h as u32)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn fmt_secs(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, (ms % 1000).abs())
}

fn fmt_f64(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v:.2}")
    }
}

fn drawtext_escape(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\'' | ':' | '\\' | '%' | ','))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{OfflineSettings, StreamItem};
    use std::collections::HashSet;

    fn test_channel() -> Channel {
        Channel {
            id: uuid::Uuid::new_v4(),
            number: 3,
            name: "movies".into(),
            group_title: String::new(),
            start_time_ms: 0,
            duration_ms: 3_600_000,
            icon: None,
            watermark: None,
            offline: OfflineSettings::default(),
            transcoding: None,
            stealth: false,
            filler_collections: Vec::new(),
            filler_repeat_cooldown_ms: 0,
            disable_filler_overlay: false,
        }
    }

    fn program_item(probe: Option<ProbeStats>) -> StreamItem {
        StreamItem {
            kind: StreamKind::Program,
            title: "A Film".into(),
            source: Some("/media/film.mkv".into()),
            start_ms: 90_000,
            stream_duration_ms: 600_000,
            beginning_offset_ms: 0,
            duration_ms: 5_400_000,
            probe,
            error: None,
        }
    }

    fn h264_probe() -> ProbeStats {
        ProbeStats {
            width: 1920,
            height: 1080,
            sar_num: 1,
            sar_den: 1,
            fps: 25.0,
            scan_type: ScanType::Progressive,
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            audio_index: None,
            audio_only: false,
        }
    }

    fn plan_for(item: &StreamItem, channel: &Channel, settings: &FfmpegSettings) -> Vec<String> {
        build_plan(&PlanRequest {
            item,
            channel,
            settings,
            audio_only: false,
            output: OutputTarget::Mpegts,
        })
        .unwrap()
    }

    fn filter_complex(args: &[String]) -> Option<String> {
        args.iter()
            .position(|a| a == "-filter_complex")
            .map(|i| args[i + 1].clone())
    }

    #[test]
    fn identical_inputs_emit_identical_arglists() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let item = program_item(Some(h264_probe()));
        let a = plan_for(&item, &channel, &settings);
        let b = plan_for(&item, &channel, &settings);
        assert_eq!(a, b);
    }

    #[test]
    fn matching_families_copy_both_streams() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.normalize_audio = false;
        settings.normalize_resolution = false;
        let item = program_item(Some(h264_probe()));
        let args = plan_for(&item, &channel, &settings);

        let joined = args.join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a copy"));
        assert!(filter_complex(&args).is_none());
    }

    #[test]
    fn mismatched_video_family_transcodes() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.normalize_audio = false;
        settings.normalize_resolution = false;
        let mut probe = h264_probe();
        probe.video_codec = "hevc".into();
        let item = program_item(Some(probe));
        let args = plan_for(&item, &channel, &settings);
        assert!(args.join(" ").contains("-c:v libx264"));
    }

    #[test]
    fn unknown_codec_pairing_transcodes() {
        assert!(!video_codec_matches("vp9", "libx264"));
        assert!(!video_codec_matches("h264", "weird_encoder"));
        assert!(video_codec_matches("h264", "h264_videotoolbox"));
        assert!(video_codec_matches("x265", "hevc_nvenc"));
        assert!(audio_codec_matches("mp3", "libmp3lame"));
        assert!(!audio_codec_matches("opus", "aac"));
    }

    #[test]
    fn fps_cap_inserts_fps_filter() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let mut probe = h264_probe();
        probe.fps = 120.0;
        let item = program_item(Some(probe));
        let args = plan_for(&item, &channel, &settings);
        assert!(filter_complex(&args).unwrap().contains("fps=60"));
    }

    #[test]
    fn interlaced_sources_get_the_configured_deinterlacer() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.deinterlace_filter = "yadif".into();
        let mut probe = h264_probe();
        probe.scan_type = ScanType::Interlaced;
        let item = program_item(Some(probe));
        let args = plan_for(&item, &channel, &settings);
        assert!(filter_complex(&args).unwrap().contains("yadif"));

        settings.deinterlace_filter = "none".into();
        let args = plan_for(&item, &channel, &settings);
        assert!(!filter_complex(&args).unwrap_or_default().contains("yadif"));
    }

    #[test]
    fn anamorphic_source_is_fit_and_padded() {
        // 1440x1080 at 4:3 SAR is 16:9; inside 1920x1080 it fills the box.
        assert_eq!(fit_resolution(1440, 1080, 4, 3, 1920, 1080), (1920, 1080));
        // 4:3 content in a 16:9 box pillarboxes at 1440.
        assert_eq!(fit_resolution(640, 480, 1, 1, 1920, 1080), (1440, 1080));

        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let mut probe = h264_probe();
        probe.width = 640;
        probe.height = 480;
        let item = program_item(Some(probe));
        let complex = filter_complex(&plan_for(&item, &channel, &settings)).unwrap();
        assert!(complex.contains("scale=1440:1080"));
        assert!(complex.contains("pad=1920:1080:(ow-iw)/2:(oh-ih)/2"));
        assert!(complex.contains("setsar=1"));
    }

    #[test]
    fn watermark_overlay_chains_from_the_right_corner() {
        let mut channel = test_channel();
        channel.watermark = Some(Watermark {
            enabled: true,
            url: Some("/media/logo.png".into()),
            width_percent: 10.0,
            vertical_margin_percent: 5.0,
            horizontal_margin_percent: 5.0,
            position: WatermarkPosition::BottomRight,
            duration_secs: 0,
            fixed_size: false,
            animated: false,
        });
        let settings = FfmpegSettings::default();
        let item = program_item(Some(h264_probe()));
        let args = plan_for(&item, &channel, &settings);
        let complex = filter_complex(&args).unwrap();
        assert!(complex.contains("scale=192:-1"));
        assert!(complex.contains("overlay=x=W-w-W*0.0500:y=H-h-H*0.0500"));
        assert!(args.join(" ").contains("-i /media/logo.png"));
    }

    #[test]
    fn animated_watermark_loops_and_shortens() {
        let mut channel = test_channel();
        channel.watermark = Some(Watermark {
            enabled: true,
            url: Some("/media/logo.gif".into()),
            width_percent: 10.0,
            vertical_margin_percent: 0.0,
            horizontal_margin_percent: 0.0,
            position: WatermarkPosition::TopLeft,
            duration_secs: 30,
            fixed_size: true,
            animated: true,
        });
        let settings = FfmpegSettings::default();
        let item = program_item(Some(h264_probe()));
        let args = plan_for(&item, &channel, &settings);
        let joined = args.join(" ");
        assert!(joined.contains("-ignore_loop 0"));
        let complex = filter_complex(&args).unwrap();
        assert!(complex.contains("overlay=shortest=1:x=W*0.0000:y=H*0.0000"));
        assert!(complex.contains("enable='between(t,0,30)'"));
    }

    #[test]
    fn filter_graph_is_well_formed() {
        let mut channel = test_channel();
        channel.watermark = Some(Watermark {
            enabled: true,
            url: Some("/media/logo.png".into()),
            width_percent: 10.0,
            vertical_margin_percent: 2.0,
            horizontal_margin_percent: 2.0,
            position: WatermarkPosition::TopRight,
            duration_secs: 0,
            fixed_size: false,
            animated: false,
        });
        let mut settings = FfmpegSettings::default();
        settings.volume_percent = 80;
        settings.apad = true;
        let mut probe = h264_probe();
        probe.fps = 120.0;
        probe.scan_type = ScanType::Interlaced;
        probe.width = 640;
        probe.height = 480;
        settings.deinterlace_filter = "yadif".into();
        let item = program_item(Some(probe));
        let complex = filter_complex(&plan_for(&item, &channel, &settings)).unwrap();

        assert!(!complex.starts_with(';'));
        let mut defined = HashSet::new();
        for step in complex.split(';') {
            let out_start = step.rfind('[').unwrap();
            let out = &step[out_start + 1..step.len() - 1];
            assert!(defined.insert(out.to_string()), "pad {out} defined twice");
        }
        // Every consumed named pad was defined by an earlier step.
        let mut seen: HashSet<String> = HashSet::new();
        for step in complex.split(';') {
            let out_start = step.rfind('[').unwrap();
            for (i, part) in step.split('[').enumerate() {
                if i == 0 {
                    continue;
                }
                let Some(end) = part.find(']') else { continue };
                let name = &part[..end];
                let is_output = step.ends_with(&format!("[{name}]"));
                if !is_output && name.starts_with('p') {
                    assert!(seen.contains(name), "pad {name} used before definition");
                }
            }
            let out = &step[out_start + 1..step.len() - 1];
            seen.insert(out.to_string());
        }
    }

    #[test]
    fn volume_and_apad_are_applied_in_order() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.volume_percent = 55;
        settings.apad = true;
        settings.normalize_audio = true;
        let item = program_item(Some(h264_probe()));
        let complex = filter_complex(&plan_for(&item, &channel, &settings)).unwrap();
        let resample = complex.find("aresample=48000").unwrap();
        let volume = complex.find("volume=0.55").unwrap();
        let apad = complex.find("apad=whole_dur=600000ms").unwrap();
        assert!(resample < volume && volume < apad);
    }

    #[test]
    fn seek_and_bound_are_on_the_command_line() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let item = program_item(Some(h264_probe()));
        let args = plan_for(&item, &channel, &settings);
        let joined = args.join(" ");
        assert!(joined.contains("-ss 90.000"));
        assert!(joined.contains("-t 600.000"));
        assert!(joined.ends_with("-f mpegts pipe:1"));
        assert!(joined.contains("service_name=movies"));
    }

    #[test]
    fn offline_item_uses_picture_and_soundtrack() {
        let mut channel = test_channel();
        channel.offline.picture = Some("/media/offline.png".into());
        channel.offline.soundtrack = Some("/media/quiet.mp3".into());
        let settings = FfmpegSettings::default();
        let item = StreamItem::offline(300_000);
        let args = plan_for(&item, &channel, &settings);
        let joined = args.join(" ");
        assert!(joined.contains("-i /media/offline.png"));
        assert!(joined.contains("-i /media/quiet.mp3"));
        let complex = filter_complex(&args).unwrap();
        assert!(complex.contains("loop=loop=-1:size=1:start=0"));
        assert!(complex.contains("aloop=loop=-1:size=2147483647"));
        assert!(complex.contains("force_original_aspect_ratio=1"));
        // Still image slate on a supported encoder gets the stillimage tune.
        assert!(joined.contains("-tune stillimage"));
    }

    #[test]
    fn error_slate_draws_title_and_message() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.error_screen = ErrorScreen::Text;
        settings.error_audio = ErrorAudio::Sine;
        settings.volume_percent = 100;
        let item = StreamItem::offline_with_error(60_000, "Redirect cycle: a -> b");
        let args = plan_for(&item, &channel, &settings);
        let joined = args.join(" ");
        assert!(joined.contains("sine=f=440:duration=60.000"));
        // Sine bed is clamped to 70%.
        let complex = filter_complex(&args).unwrap();
        assert!(complex.contains("volume=0.70"));
        assert!(complex.contains("fontsize=50"));
        assert!(complex.contains("fontsize=33"));
        assert!(complex.contains("Redirect cycle"));
    }

    #[test]
    fn kill_mode_refuses_synthetic_streams() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.error_screen = ErrorScreen::Kill;
        let item = StreamItem::offline_with_error(60_000, "boom");
        let err = build_plan(&PlanRequest {
            item: &item,
            channel: &channel,
            settings: &settings,
            audio_only: false,
            output: OutputTarget::Mpegts,
        })
        .unwrap_err();
        assert!(matches!(err, StreamError::EncoderRefused));
    }

    #[test]
    fn loading_item_is_a_short_black_splice() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let item = StreamItem::loading();
        let args = plan_for(&item, &channel, &settings);
        let joined = args.join(" ");
        assert!(joined.contains("color=c=black:s=1920x1080:d=0.040"));
        assert!(joined.contains("aevalsrc=0:duration=0.040"));
        assert!(joined.contains("-t 0.040"));
    }

    #[test]
    fn audio_only_error_uses_whitenoise() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let item = StreamItem::offline_with_error(60_000, "radio error");
        let args = build_plan(&PlanRequest {
            item: &item,
            channel: &channel,
            settings: &settings,
            audio_only: true,
            output: OutputTarget::Mpegts,
        })
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("aevalsrc=random(0):duration=60.000"));
        assert!(!joined.contains("-c:v"));
    }

    #[test]
    fn hls_output_honours_the_configured_delete_threshold() {
        let channel = test_channel();
        let mut settings = FfmpegSettings::default();
        settings.hls.hls_delete_threshold = 7;
        let item = program_item(Some(h264_probe()));
        let args = build_plan(&PlanRequest {
            item: &item,
            channel: &channel,
            settings: &settings,
            audio_only: false,
            output: OutputTarget::Hls {
                dir: PathBuf::from("/tmp/hls/3"),
            },
        })
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-hls_delete_threshold 7"));
        assert!(joined.contains("/tmp/hls/3/seg_%05d.ts"));
        assert!(joined.ends_with("/tmp/hls/3/stream.m3u8"));
    }

    #[test]
    fn dash_output_writes_a_manifest_into_the_segment_dir() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let item = program_item(Some(h264_probe()));
        let args = build_plan(&PlanRequest {
            item: &item,
            channel: &channel,
            settings: &settings,
            audio_only: false,
            output: OutputTarget::Dash {
                dir: PathBuf::from("/tmp/dash/3"),
            },
        })
        .unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f dash"));
        assert!(joined.ends_with("/tmp/dash/3/stream.mpd"));
    }

    #[test]
    fn concat_plan_loops_the_playlist_forever() {
        let channel = test_channel();
        let settings = FfmpegSettings::default();
        let args = build_concat_plan(
            &settings,
            &channel,
            "http://localhost:8000/playlist?channel=3&session=4",
            false,
            OutputTarget::Mpegts,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f concat"));
        assert!(joined.contains("-stream_loop -1"));
        assert!(joined.contains("-c copy"));
        assert!(joined.ends_with("-f mpegts pipe:1"));

        let radio = build_concat_plan(
            &settings,
            &channel,
            "http://localhost:8000/playlist?channel=3&session=4&audioOnly=1",
            true,
            OutputTarget::Mpegts,
        );
        let joined = radio.join(" ");
        assert!(joined.contains("-map 0:a"));
        assert!(!joined.contains("-map 0:v"));
    }

    #[test]
    fn channel_overrides_win_the_option_merge() {
        let mut channel = test_channel();
        channel.transcoding = Some(crate::channels::TranscodingOverrides {
            resolution: Some("1280x720".into()),
            video_bitrate_kbps: Some(4_000),
            video_buffer_kb: None,
        });
        let mut settings = FfmpegSettings::default();
        settings.resolution = Some("1920x1080".into());
        settings.video_bitrate_kbps = Some(8_000);
        settings.video_buffer_kb = Some(4_096);

        let opts = resolve_transcode_options(&settings, &channel);
        assert_eq!((opts.width, opts.height), (1280, 720));
        assert_eq!(opts.video_bitrate_kbps, 4_000);
        // No channel override: the global setting shows through.
        assert_eq!(opts.video_buffer_kb, 4_096);

        channel.transcoding = None;
        settings.resolution = None;
        let opts = resolve_transcode_options(&settings, &channel);
        assert_eq!((opts.width, opts.height), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
    }
}
