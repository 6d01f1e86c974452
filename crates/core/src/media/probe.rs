use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tracing::warn;

use crate::types::FrameSize;

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    /// Container header frame count; absent or wrong for many AVI/MOV files.
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
    #[serde(default)]
    tags: HashMap<String, serde_json::Value>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeSideData {
    /// Display matrix rotation in degrees, e.g. `-90` for portrait phone clips.
    rotation: Option<serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn json_degrees(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .or_else(|| {
            value
                .as_str()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|f| f.round() as i64)
        })
}

/// Display rotation normalized to `0..360`. The display matrix wins over the
/// legacy `rotate` tag.
fn display_rotation(stream: &FfprobeStream) -> u32 {
    let degrees = stream
        .side_data_list
        .iter()
        .find_map(|side| side.rotation.as_ref().and_then(json_degrees))
        .or_else(|| stream.tags.get("rotate").and_then(json_degrees))
        .unwrap_or(0);
    degrees.rem_euclid(360) as u32
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe; is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe could not read {} (status {}): {}",
            path.display(),
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON output")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    /// Size of the frames ffmpeg emits after autorotation.
    pub size: FrameSize,
    pub rotation: u32,
    pub fps: f64,
    pub codec_name: String,
    /// Best-effort frame count for progress reporting. Never used to decide
    /// how many frames to read.
    pub frame_count: Option<u64>,
}

pub fn extract_stream_info(probe: &FfprobeOutput) -> Result<VideoStreamInfo> {
    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;
    let rotation = display_rotation(stream);
    let size = match rotation {
        90 | 270 => FrameSize::new(height, width),
        _ => FrameSize::new(width, height),
    };
    if size.is_empty() {
        bail!("video stream has empty frame size {size}");
    }

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = parse_frame_rate(fps_str).unwrap_or(0.0);
    if fps <= 0.0 {
        warn!("could not determine frame rate (got {fps_str}), defaulting to 25");
    }
    let fps = if fps <= 0.0 { 25.0 } else { fps };

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| {
            let duration = stream
                .duration
                .as_deref()
                .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))?
                .parse::<f64>()
                .ok()?;
            (duration > 0.0).then(|| (duration * fps).round() as u64)
        });

    Ok(VideoStreamInfo {
        stream_index: stream.index,
        size,
        rotation,
        fps,
        codec_name: stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        frame_count,
    })
}
