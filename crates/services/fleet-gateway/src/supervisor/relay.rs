//! Relay command construction
//!
//! A relay pulls one camera's RTSP stream, depacketizes and parses the H.264
//! elementary stream, and pushes it into the sink stream named by
//! `sink_stream_id`.

use crate::credentials::Credentials;
use crate::fleet::CameraStreamSpec;

/// A fully resolved process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RelayInvocation {
    /// Command line for logs, without environment
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds the relay invocation for one camera
pub trait RelayCommand: Send + Sync {
    fn build(&self, camera: &CameraStreamSpec, credentials: &Credentials) -> RelayInvocation;
}

/// GStreamer pipeline ending in the Kinesis Video Streams sink
#[derive(Debug, Clone)]
pub struct GstKvsRelay {
    /// `gst-launch-1.0` or an absolute path to it
    pub program: String,

    /// Sink buffer (storage) size in MB
    pub storage_size_mb: u32,

    pub region: String,
}

impl GstKvsRelay {
    pub fn new(program: impl Into<String>, storage_size_mb: u32, region: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            storage_size_mb,
            region: region.into(),
        }
    }
}

impl RelayCommand for GstKvsRelay {
    fn build(&self, camera: &CameraStreamSpec, credentials: &Credentials) -> RelayInvocation {
        let mut args: Vec<String> = vec![
            "rtspsrc".into(),
            format!("location={}", camera.source_uri),
            "short-header=TRUE".into(),
            "!".into(),
            "rtph264depay".into(),
            "!".into(),
            "h264parse".into(),
            "!".into(),
            "video/x-h264,stream-format=avc,alignment=au".into(),
            "!".into(),
            "kvssink".into(),
            format!("stream-name={}", camera.sink_stream_id),
            format!("storage-size={}", self.storage_size_mb),
            format!("aws-region={}", self.region),
        ];

        if let Some(fps) = camera.frame_rate {
            args.push(format!("framerate={}", fps));
        }
        if let Some(kbps) = camera.bitrate_hint {
            args.push(format!("avg-bandwidth-bps={}", u64::from(kbps) * 1000));
        }

        let mut env = credentials.to_env();
        env.push(("AWS_DEFAULT_REGION".to_string(), self.region.clone()));

        RelayInvocation {
            program: self.program.clone(),
            args,
            env,
        }
    }
}
