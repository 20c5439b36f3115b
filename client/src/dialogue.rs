//! Bridge to the conversational backend behind the NPC
//!
//! The backend call runs on its own thread so the frame loop never waits on it. The bridge
//! admits one outstanding request at a time and turns every failure into a single fallback line.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Shown when an empty request reaches the NPC.
pub const SILENT_REPLY: &str = "You approached me but didn't say anything.";
/// Shown once when the backend fails or goes away.
pub const FALLBACK_REPLY: &str = "The Quest Giver seems lost in thought. Try again in a moment.";

/// Audio as already encoded by whoever captured it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAudio {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseInput {
    pub text: Option<String>,
    pub audio: Option<EncodedAudio>,
}

impl ConverseInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            audio: None,
        }
    }

    pub fn audio(audio: EncodedAudio) -> Self {
        Self {
            text: None,
            audio: Some(audio),
        }
    }

    pub fn is_empty(&self) -> bool {
        let no_text = self.text.as_deref().map_or(true, |t| t.trim().is_empty());
        let no_audio = self.audio.as_ref().map_or(true, |a| a.bytes.is_empty());
        no_text && no_audio
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverseReply {
    pub reply_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogueError {
    #[error("a dialogue request is already in flight")]
    Busy,
    #[error("not close enough to the NPC")]
    NotNear,
    #[error("dialogue backend failed: {0}")]
    Backend(String),
}

pub trait DialogueBackend: Send + Sync {
    fn converse(&self, input: ConverseInput) -> Result<ConverseReply, DialogueError>;
}

/// A line ready to show in the dialogue box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub text: String,
    /// The line replaces a reply that never came.
    pub fallback: bool,
}

impl DialogueLine {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fallback: false,
        }
    }

    fn fallback() -> Self {
        Self {
            text: FALLBACK_REPLY.to_string(),
            fallback: true,
        }
    }
}

type PendingReply = oneshot::Receiver<Result<ConverseReply, DialogueError>>;

pub struct DialogueBridge {
    backend: Arc<dyn DialogueBackend>,
    pending: Option<PendingReply>,
    local_reply: Option<DialogueLine>,
}

impl DialogueBridge {
    pub fn new(backend: Arc<dyn DialogueBackend>) -> Self {
        Self {
            backend,
            pending: None,
            local_reply: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.local_reply.is_some()
    }

    /// Starts a conversation turn. Only allowed while the player is near the NPC and nothing
    /// else is outstanding.
    pub fn request(&mut self, input: ConverseInput, near_npc: bool) -> Result<(), DialogueError> {
        if self.is_busy() {
            return Err(DialogueError::Busy);
        }
        if !near_npc {
            return Err(DialogueError::NotNear);
        }
        if input.is_empty() {
            self.local_reply = Some(DialogueLine::reply(SILENT_REPLY));
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        thread::Builder::new()
            .name("dialogue".to_string())
            .spawn(move || {
                let result = backend.converse(input);
                // The bridge may have been cancelled in the meantime.
                let _ = reply_tx.send(result);
            })
            .map_err(|e| DialogueError::Backend(e.to_string()))?;

        debug!("Dialogue request sent");
        self.pending = Some(reply_rx);
        Ok(())
    }

    /// Non-blocking check for the outstanding reply.
    pub fn poll(&mut self) -> Option<DialogueLine> {
        if let Some(line) = self.local_reply.take() {
            return Some(line);
        }

        let receiver = self.pending.as_mut()?;
        let line = match receiver.try_recv() {
            Ok(Ok(reply)) => DialogueLine::reply(reply.reply_text),
            Ok(Err(e)) => {
                warn!("Dialogue backend error: {}", e);
                DialogueLine::fallback()
            }
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => {
                warn!("Dialogue worker exited without replying");
                DialogueLine::fallback()
            }
        };
        self.pending = None;
        Some(line)
    }

    /// Waits for the outstanding reply, for callers that are not frame driven.
    pub async fn reply(&mut self) -> Option<DialogueLine> {
        if let Some(line) = self.local_reply.take() {
            return Some(line);
        }

        let receiver = self.pending.take()?;
        Some(match receiver.await {
            Ok(Ok(reply)) => DialogueLine::reply(reply.reply_text),
            Ok(Err(e)) => {
                warn!("Dialogue backend error: {}", e);
                DialogueLine::fallback()
            }
            Err(_) => DialogueLine::fallback(),
        })
    }

    /// Abandons the outstanding request; its reply is discarded when it arrives.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            info!("Dialogue request cancelled");
        }
        self.local_reply = None;
    }
}

/// Offline stand-in for the quest giver.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    latency: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl DialogueBackend for ScriptedBackend {
    fn converse(&self, input: ConverseInput) -> Result<ConverseReply, DialogueError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let text = input.text.unwrap_or_default().to_lowercase();
        let reply_text = if text.contains("quest") || text.contains("task") {
            "Fetch the blue folder from the south office and I'll make it worth your while."
        } else if text.contains("hello") || text.starts_with("hi") {
            "Well met, traveller. I'm Ana. Looking for a quest?"
        } else if text.is_empty() {
            "I heard something, but my ears aren't what they used to be. Could you type it?"
        } else {
            "Interesting... come back when you're ready for a quest."
        };

        Ok(ConverseReply {
            reply_text: reply_text.to_string(),
        })
    }
}
