//! Content Generation
//!
//! Interface to the AI content generators whose output the hub streams to
//! requesters and, for some kinds, reveals to the whole room.
//!
//! The generators themselves live in other services. This module defines the
//! seam ([`ContentGenerator`]) plus an HTTP client for it.

mod client;

pub use client::{HttpContentGenerator, UnconfiguredGenerator};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of content a generator is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Location,
    NpcDialogue,
    Narration,
    PlotTwist,
    Hazard,
    DmAssistant,
}

impl ContentKind {
    /// Path segment used by the generator service
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Location => "location",
            ContentKind::NpcDialogue => "npc_dialogue",
            ContentKind::Narration => "narration",
            ContentKind::PlotTwist => "plot_twist",
            ContentKind::Hazard => "hazard",
            ContentKind::DmAssistant => "dm_assistant",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub kind: ContentKind,
    /// Game session the request was issued from
    pub room: String,
    /// User id of the requester
    pub requested_by: String,
    /// Client-supplied parameters, passed through untouched
    pub request: Value,
}

/// Receives partial results while a generator is still working
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn partial(&self, data: Value);
}

/// Produces game content on request
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Run a generation job to completion
    ///
    /// Implementations that stream may push intermediate chunks through
    /// `progress`; the returned value is the final result.
    async fn generate(
        &self,
        request: GenerationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<Value, GenerationError>;
}

/// Errors returned by content generators
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("content generation unavailable")]
    Unavailable,

    #[error("content generation timed out")]
    Timeout,

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generator error ({status}): {message}")]
    Generator { status: u16, message: String },

    #[error("malformed generator stream: {0}")]
    Stream(String),

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
}
