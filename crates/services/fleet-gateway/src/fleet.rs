//! Fleet data model
//!
//! A [`FleetConfiguration`] is the validated camera list for one run cycle.
//! It is replaced wholesale on every reconfiguration and never mutated.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Frame size hint for a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One camera to relay into one sink stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraStreamSpec {
    /// RTSP source URI
    #[serde(default, alias = "sourceUri", alias = "rtsp_url")]
    pub source_uri: String,

    /// Destination stream name, unique across the fleet
    #[serde(default, alias = "sinkStreamId", alias = "kvs_stream_id")]
    pub sink_stream_id: String,

    /// Human-readable label
    #[serde(default, alias = "name", alias = "camera_id")]
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    #[serde(
        default,
        alias = "frameRate",
        alias = "fps",
        skip_serializing_if = "Option::is_none"
    )]
    pub frame_rate: Option<u32>,

    /// Expected bitrate in kbps
    #[serde(default, alias = "bitrateHint", skip_serializing_if = "Option::is_none")]
    pub bitrate_hint: Option<u32>,

    /// Disabled cameras stay in the configuration but are not launched
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl CameraStreamSpec {
    /// Create an enabled camera with no media hints
    pub fn new(source_uri: impl Into<String>, sink_stream_id: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            sink_stream_id: sink_stream_id.into(),
            label: String::new(),
            resolution: None,
            frame_rate: None,
            bitrate_hint: None,
            enabled: true,
        }
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the frame rate hint
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = Some(fps);
        self
    }

    /// Set the bitrate hint (kbps)
    pub fn with_bitrate_hint(mut self, kbps: u32) -> Self {
        self.bitrate_hint = Some(kbps);
        self
    }

    /// Mark the camera disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Label if set, otherwise the sink stream id
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.sink_stream_id
        } else {
            &self.label
        }
    }
}

/// The validated camera list for one run cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfiguration {
    pub cameras: Vec<CameraStreamSpec>,
    pub version: String,
}

impl FleetConfiguration {
    /// Build a configuration, rejecting empty keys and duplicate sink ids
    pub fn new(cameras: Vec<CameraStreamSpec>, version: impl Into<String>) -> Result<Self> {
        let config = Self {
            cameras,
            version: version.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// An idle fleet with no cameras
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            cameras: Vec::new(),
            version: version.into(),
        }
    }

    /// Check the fleet invariants
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.cameras.len());

        for (index, camera) in self.cameras.iter().enumerate() {
            if camera.sink_stream_id.trim().is_empty() {
                return Err(Error::ConfigParse(format!(
                    "camera #{} ({}) has an empty sink_stream_id",
                    index,
                    if camera.label.is_empty() { "unlabelled" } else { camera.label.as_str() }
                )));
            }
            if camera.source_uri.trim().is_empty() {
                return Err(Error::ConfigParse(format!(
                    "camera {} has an empty source_uri",
                    camera.sink_stream_id
                )));
            }
            if !seen.insert(camera.sink_stream_id.as_str()) {
                return Err(Error::ConfigParse(format!(
                    "duplicate sink_stream_id: {}",
                    camera.sink_stream_id
                )));
            }
        }

        Ok(())
    }

    /// Cameras that will be launched
    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraStreamSpec> {
        self.cameras.iter().filter(|c| c.enabled)
    }

    /// Number of cameras (enabled or not)
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    /// Whether the fleet is idle
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Parse a configuration store document
    ///
    /// Accepts a bare JSON array of cameras or an object with a `cameras`
    /// array and optional `version`. `store_version` (from the store's
    /// response metadata) wins over the document's own version; with
    /// neither, the version is derived from the content digest.
    pub fn from_document(content: &[u8], store_version: Option<&str>) -> Result<Self> {
        let document: FleetDocument = serde_json::from_slice(content)
            .map_err(|e| Error::ConfigParse(format!("invalid fleet document: {}", e)))?;

        let (cameras, document_version) = match document {
            FleetDocument::Bare(cameras) => (cameras, None),
            FleetDocument::Wrapped { cameras, version } => (cameras, version),
        };

        let version = store_version
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or(document_version)
            .unwrap_or_else(|| content_version(content));

        Self::new(cameras, version)
    }

    /// Write the canonical snapshot atomically (temp file + rename)
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read and re-validate a snapshot written by [`write_snapshot`](Self::write_snapshot)
    pub fn read_snapshot(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let config: FleetConfiguration = serde_json::from_slice(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FleetDocument {
    Bare(Vec<CameraStreamSpec>),
    Wrapped {
        cameras: Vec<CameraStreamSpec>,
        #[serde(default)]
        version: Option<String>,
    },
}

/// Short content digest used as a version when the store provides none
pub fn content_version(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    format!("sha256:{}", &hex::encode(digest)[..16])
}
