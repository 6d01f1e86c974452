//! H.264/MP4 encoding of predicted frames through an FFmpeg subprocess.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tracing::debug;

use crate::types::FrameSize;

/// Consumer of output frames, in order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    pub size: FrameSize,
    pub fps: u32,
    /// Video codec (e.g. "libx264").
    pub codec: String,
    pub crf: u32,
    /// Output pixel format. `yuv420p` keeps the file playable in browsers.
    pub pixel_format: String,
}

impl EncoderConfig {
    pub fn mp4(output_path: impl Into<PathBuf>, size: FrameSize, fps: u32) -> Self {
        Self {
            output_path: output_path.into(),
            size,
            fps,
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
        }
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        // 4:2:0 chroma subsampling needs even dimensions.
        let vf_filter = "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string();

        vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            self.size.to_string(),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-vf".into(),
            vf_filter,
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-movflags".into(),
            "+faststart".into(),
            "-v".into(),
            "error".into(),
            self.output_path.to_string_lossy().into_owned(),
        ]
    }
}

/// FFmpeg encode subprocess. Accepts raw RGB frames via stdin pipe, drains
/// stderr in a background thread, kills FFmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    size: FrameSize,
    frames_written: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        if config.size.is_empty() {
            bail!("cannot encode {} frames", config.size);
        }
        if config.fps == 0 {
            bail!("encoder frame rate must be positive");
        }

        let args = config.build_ffmpeg_args();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        debug!(
            size = %config.size,
            fps = config.fps,
            codec = %config.codec,
            crf = config.crf,
            pix_fmt = %config.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            size: config.size,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let actual = FrameSize::new(frame.width(), frame.height());
        if actual != self.size {
            bail!("frame size mismatch: encoder expects {}, got {actual}", self.size);
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(frame.as_raw())
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!(frames = self.frames_written, "FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_ffmpeg_args_basic_structure() {
        let config = EncoderConfig::mp4("/tmp/out.mp4", FrameSize::square(256), 25);
        let args = config.build_ffmpeg_args();

        let s_idx = args.iter().position(|a| a == "-s").unwrap();
        let r_idx = args.iter().position(|a| a == "-r").unwrap();
        let i_idx = args.iter().position(|a| a == "-i").unwrap();
        let c_idx = args.iter().position(|a| a == "-c:v").unwrap();
        let movflags_idx = args.iter().position(|a| a == "-movflags").unwrap();

        assert_eq!(args[s_idx + 1], "256x256");
        assert_eq!(args[r_idx + 1], "25");
        assert_eq!(args[i_idx + 1], "pipe:0");
        assert!(r_idx < i_idx, "input rate must precede -i");
        assert_eq!(args[c_idx + 1], "libx264");
        assert_eq!(args[movflags_idx + 1], "+faststart");
        assert!(args.contains(&"yuv420p".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_ffmpeg_args_fps_and_size_follow_config() {
        let config = EncoderConfig::mp4("out.mp4", FrameSize::new(320, 240), 30);
        let args = config.build_ffmpeg_args();
        assert!(args.contains(&"320x240".to_string()));
        assert!(args.contains(&"30".to_string()));
    }

    #[cfg(unix)]
    fn mock_encoder(size: FrameSize) -> VideoEncoder {
        let mut child = std::process::Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn mock encoder process");
        let stdin = child.stdin.take().expect("mock child stdin must be piped");
        VideoEncoder {
            child,
            stdin: Some(stdin),
            stderr_thread: None,
            size,
            frames_written: 0,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_frame_sink_accepts_matching_frames() {
        let mut encoder = mock_encoder(FrameSize::new(1, 2));
        let frame = RgbImage::from_pixel(1, 2, Rgb([1, 2, 3]));

        FrameSink::write_frame(&mut encoder, &frame).expect("write should succeed");
        FrameSink::write_frame(&mut encoder, &frame).expect("write should succeed");
        FrameSink::finish(&mut encoder).expect("mock encoder should finish successfully");
        assert_eq!(encoder.frames_written(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_frame_sink_rejects_wrong_size() {
        let mut encoder = mock_encoder(FrameSize::new(4, 4));
        let err = FrameSink::write_frame(&mut encoder, &RgbImage::new(2, 2)).unwrap_err();
        assert!(err.to_string().contains("frame size mismatch"));
    }

    #[test]
    fn test_encoder_rejects_zero_fps() {
        let config = EncoderConfig::mp4("out.mp4", FrameSize::square(8), 0);
        assert!(VideoEncoder::new(&config).is_err());
    }

    #[test]
    #[ignore]
    fn test_encode_produces_playable_mp4() {
        let temp = tempfile::tempdir().unwrap();
        let output = temp.path().join("out.mp4");
        let size = FrameSize::square(64);

        let mut encoder = VideoEncoder::new(&EncoderConfig::mp4(&output, size, 25)).unwrap();
        for i in 0..5u8 {
            encoder
                .write_frame(&RgbImage::from_pixel(64, 64, Rgb([i * 40, 0, 0])))
                .unwrap();
        }
        encoder.finish().unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert!(crate::media::has_mp4_signature(&bytes));

        let probe = crate::media::run_ffprobe(&output).unwrap();
        let info = crate::media::probe::extract_stream_info(&probe).unwrap();
        assert_eq!(info.size, size);
        assert_eq!(info.frame_count, Some(5));
    }
}
