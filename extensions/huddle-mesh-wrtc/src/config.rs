//! Tunables for a call. Every struct has a `Default` matching production values and
//! deserializes from partial JSON, missing fields keep their defaults.

use std::time::Duration;

use huddle::error::Error;
use serde::{Deserialize, Serialize};

use crate::transport::TransportConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: Vec<String>, username: &str, credential: &str) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// When the local capture devices are opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAcquisition {
    /// As part of joining
    #[default]
    OnJoin,
    /// Only once the call has been answered
    OnAnswer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// Samples per analysis window. Yields `fft_size / 2` frequency bins.
    pub fft_size: usize,
    /// Mean level, on the 0..=255 scale, a stream must exceed to count as speaking
    pub noise_floor: f32,
    /// Weight of the previous window when averaging magnitudes over time
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub tick_ms: u64,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            noise_floor: 15.0,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            tick_ms: 16,
        }
    }
}

impl SpeakerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Sample rate of the mixed audio track
    pub sample_rate: u32,
    /// Quality of the JPEG pictures stored per video frame
    pub jpeg_quality: u8,
    /// Folder on the media host the finished file is uploaded to
    pub folder: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            sample_rate: 48000,
            jpeg_quality: 75,
            folder: "tasktalk-recordings".into(),
        }
    }
}

impl RecorderConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub ice_servers: Vec<IceServer>,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let mut ice_servers = vec![IceServer::stun("stun:stun.l.google.com:19302")];
        ice_servers.extend(
            (1..=4).map(|n| IceServer::stun(format!("stun:stun{n}.l.google.com:19302"))),
        );
        ice_servers.push(IceServer::turn(
            vec![
                "turn:openrelay.metered.ca:80".into(),
                "turn:openrelay.metered.ca:443".into(),
            ],
            "openrelayproject",
            "openrelayproject",
        ));
        Self {
            ice_servers,
            connect_timeout_ms: 45_000,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 10_000,
        }
    }
}

impl ViewerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before retry number `attempt`, counting from zero
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingConfig {
    pub poll_interval_ms: u64,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
        }
    }
}

impl IncomingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    /// Largest number of participants, local one included, this client links with
    pub max_mesh_size: usize,
    pub media_acquisition: MediaAcquisition,
    pub speaker: SpeakerConfig,
    pub recorder: RecorderConfig,
    pub viewer: ViewerConfig,
    pub incoming: IncomingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
            ice_candidate_pool_size: 10,
            max_mesh_size: 8,
            media_acquisition: MediaAcquisition::default(),
            speaker: SpeakerConfig::default(),
            recorder: RecorderConfig::default(),
            viewer: ViewerConfig::default(),
            incoming: IncomingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::from)
    }

    /// Production servers with short timers, for local runs
    pub fn development() -> Self {
        Self {
            viewer: ViewerConfig {
                connect_timeout_ms: 5000,
                backoff_base_ms: 100,
                backoff_max_ms: 1000,
                ..Default::default()
            },
            incoming: IncomingConfig {
                poll_interval_ms: 250,
            },
            ..Default::default()
        }
    }

    /// No ICE servers at all. Used with the loopback transport.
    pub fn minimal() -> Self {
        let mut config = Self::development();
        config.ice_servers.clear();
        config.ice_candidate_pool_size = 0;
        config.viewer.ice_servers.clear();
        config
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            receive_only: false,
        }
    }

    pub fn viewer_transport(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.viewer.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            receive_only: true,
        }
    }
}
