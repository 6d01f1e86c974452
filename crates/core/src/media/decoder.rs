use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::probe::{extract_stream_info, run_ffprobe, VideoStreamInfo};
use crate::normalize::normalize_rgb;
use crate::types::FrameSize;

/// Lines of ffmpeg stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Decodes video to packed RGB frames via an FFmpeg subprocess, yielding one
/// frame at a time. FFmpeg converts from the codec's native layout to `rgb24`.
/// Drains stderr in a background thread to prevent pipe deadlock. Kills
/// FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    size: FrameSize,
    frame_len: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
    stderr_tail: StderrTail,
    buf: Vec<u8>,
    frames_read: u64,
    done: bool,
}

/// Logs every stderr line on `ffmpeg_stderr` and keeps the last few.
fn spawn_stderr_drain(stderr: ChildStderr, tail: StderrTail) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    debug!(target: "ffmpeg_stderr", "{}", line);
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    })
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-an".to_string(),
        // One output frame per decoded frame, even for variable frame rate input.
        "-fps_mode".to_string(),
        "passthrough".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

impl VideoDecoder {
    pub fn new(path: &Path, info: &VideoStreamInfo) -> Result<Self> {
        let args = build_decoder_args(path, info.stream_index);

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_tail = StderrTail::default();
        let stderr_thread = spawn_stderr_drain(stderr, Arc::clone(&stderr_tail));

        debug!(
            path = %path.display(),
            size = %info.size,
            rotation = info.rotation,
            codec = %info.codec_name,
            "FFmpeg decoder started"
        );

        Ok(Self::from_child(
            child,
            info.size,
            Some(stderr_thread),
            stderr_tail,
        ))
    }

    fn from_child(
        child: Child,
        size: FrameSize,
        stderr_thread: Option<thread::JoinHandle<()>>,
        stderr_tail: StderrTail,
    ) -> Self {
        let frame_len = size.rgb_len();
        Self {
            child,
            size,
            frame_len,
            stderr_thread,
            stderr_tail,
            buf: vec![0u8; frame_len],
            frames_read: 0,
            done: false,
        }
    }

    /// Called at EOF before any frame arrived: reports a failed ffmpeg run
    /// with its exit status and last stderr lines.
    fn check_exit_without_frames(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .context("failed to wait for ffmpeg decoder")?;
        if status.success() {
            return Ok(());
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if tail.is_empty() {
            bail!("ffmpeg failed to decode driving video ({status})");
        }
        bail!("ffmpeg failed to decode driving video ({status}): {tail}");
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_len {
            match stdout.read(&mut self.buf[total_read..self.frame_len]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_len
                        );
                    }
                    if self.frames_read == 0 {
                        self.check_exit_without_frames()?;
                    }
                    return Ok(None);
                }
                Ok(n) => {
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        let frame = RgbImage::from_raw(
            self.size.width,
            self.size.height,
            self.buf[..self.frame_len].to_vec(),
        )
        .ok_or_else(|| anyhow!("decoded frame does not match {}", self.size))?;
        self.frames_read += 1;
        Ok(Some(frame))
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Letterboxes every frame of an inner frame iterator. Stops after the first
/// error.
pub struct NormalizedFrames<I> {
    inner: I,
    target: FrameSize,
    done: bool,
}

pub fn normalized_frames<I>(frames: I, target: FrameSize) -> NormalizedFrames<I::IntoIter>
where
    I: IntoIterator<Item = Result<RgbImage>>,
{
    NormalizedFrames {
        inner: frames.into_iter(),
        target,
        done: false,
    }
}

impl<I> Iterator for NormalizedFrames<I>
where
    I: Iterator<Item = Result<RgbImage>>,
{
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.inner.next()? {
            Ok(frame) => normalize_rgb(frame, self.target),
            Err(e) => Err(e),
        };
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

/// An uploaded driving video: the scratch copy on disk plus the decoder
/// reading it. Yields normalized frames in presentation order.
///
/// Field order matters: the decoder is reaped before the scratch file is
/// deleted.
pub struct DrivingVideo {
    frames: NormalizedFrames<VideoDecoder>,
    info: VideoStreamInfo,
    _scratch: NamedTempFile,
}

impl DrivingVideo {
    /// Copies `bytes` to a scratch file (keeping `extension` so FFmpeg can
    /// pick the demuxer), probes it and starts decoding.
    pub fn from_bytes(bytes: &[u8], extension: &str, target: FrameSize) -> Result<Self> {
        let mut scratch = tempfile::Builder::new()
            .prefix("puppeteer-driving-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .context("failed to create scratch file for driving video")?;
        scratch
            .write_all(bytes)
            .and_then(|_| scratch.flush())
            .context("failed to write driving video to scratch file")?;

        let probe = run_ffprobe(scratch.path())?;
        let info = extract_stream_info(&probe).context("driving video is not usable")?;
        let decoder = VideoDecoder::new(scratch.path(), &info)?;

        Ok(Self {
            frames: normalized_frames(decoder, target),
            info,
            _scratch: scratch,
        })
    }

    pub fn info(&self) -> &VideoStreamInfo {
        &self.info
    }
}

impl Iterator for DrivingVideo {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.next()
    }
}
