//! Boundary to the local audio processing pipeline.

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RoutingMode {
    /// Every connected peer receives the processed microphone stream.
    Broadcast,
    /// Only `target` receives it.
    Exclusive { target: String },
}

/// Opaque reference to a media stream owned by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    pub id: String,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio pipeline rejected input stream {0}")]
    UnsupportedInput(String),
    #[error("audio pipeline error: {0}")]
    Pipeline(String),
}

pub trait AudioPipeline: Send + Sync {
    fn process_input(&self, input: MediaStreamHandle) -> Result<MediaStreamHandle, AudioError>;
    fn set_routing_mode(&self, mode: RoutingMode);
    fn set_mic_muted(&self, muted: bool);
    /// Current input level in `[0, 1]`.
    fn input_level(&self) -> f32;
}

#[derive(Debug)]
struct PassthroughState {
    routing: RoutingMode,
    routing_history: Vec<RoutingMode>,
    mic_muted: bool,
}

/// Pipeline that forwards the input unchanged and remembers what it was told.
#[derive(Debug)]
pub struct PassthroughAudio {
    state: Mutex<PassthroughState>,
}

impl Default for PassthroughAudio {
    fn default() -> Self {
        Self {
            state: Mutex::new(PassthroughState {
                routing: RoutingMode::Broadcast,
                routing_history: Vec::new(),
                mic_muted: false,
            }),
        }
    }
}

impl PassthroughAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.state.lock().routing.clone()
    }

    /// Every routing change applied so far, oldest first.
    pub fn routing_history(&self) -> Vec<RoutingMode> {
        self.state.lock().routing_history.clone()
    }

    pub fn mic_muted(&self) -> bool {
        self.state.lock().mic_muted
    }
}

impl AudioPipeline for PassthroughAudio {
    fn process_input(&self, input: MediaStreamHandle) -> Result<MediaStreamHandle, AudioError> {
        if input.id.is_empty() {
            return Err(AudioError::UnsupportedInput("<empty id>".into()));
        }
        Ok(MediaStreamHandle::new(format!("{}:processed", input.id)))
    }

    fn set_routing_mode(&self, mode: RoutingMode) {
        let mut state = self.state.lock();
        state.routing_history.push(mode.clone());
        state.routing = mode;
    }

    fn set_mic_muted(&self, muted: bool) {
        self.state.lock().mic_muted = muted;
    }

    fn input_level(&self) -> f32 {
        if self.state.lock().mic_muted { 0.0 } else { 1.0 }
    }
}
