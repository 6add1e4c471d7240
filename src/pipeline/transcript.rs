//! Transcript ordering.
//!
//! User text is surfaced as soon as it is finalized. Assistant text usually
//! arrives well before its audio, so it is held until the first audio chunk
//! of the response and released together with it; if a response ends with
//! no audio at all, its text is released when the response ends.

use crate::pipeline::messages::Role;

/// Holds assistant text until the matching audio starts flowing.
#[derive(Debug, Default)]
pub struct TranscriptGate {
    held: Vec<String>,
    audio_flowing: bool,
}

impl TranscriptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept finalized text, returning whatever may be shown now.
    pub fn on_text(&mut self, role: Role, text: String) -> Vec<(Role, String)> {
        match role {
            Role::User => vec![(Role::User, text)],
            Role::Assistant if self.audio_flowing => vec![(Role::Assistant, text)],
            Role::Assistant => {
                self.held.push(text);
                Vec::new()
            }
        }
    }

    /// A new assistant response begins; its text may already be held.
    pub fn on_speech_start(&mut self) {
        self.audio_flowing = false;
    }

    /// An audio chunk arrived.
    pub fn on_audio(&mut self) -> Vec<(Role, String)> {
        if self.audio_flowing {
            return Vec::new();
        }
        self.audio_flowing = true;
        self.release()
    }

    /// The response finished sending.
    pub fn on_speech_done(&mut self) -> Vec<(Role, String)> {
        self.audio_flowing = false;
        self.release()
    }

    /// Number of assistant lines being held.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Drop everything (session teardown).
    pub fn clear(&mut self) {
        self.held.clear();
        self.audio_flowing = false;
    }

    fn release(&mut self) -> Vec<(Role, String)> {
        self.held
            .drain(..)
            .map(|text| (Role::Assistant, text))
            .collect()
    }
}
