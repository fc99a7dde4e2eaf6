//! stagecall - staged voice conversations over Gemini Live
//!
//! The crate streams microphone audio into a live session, plays the
//! synthesized answers back without gaps, handles barge-in, and moves the
//! conversation through a plan of scripted stages, recycling the session at
//! each step.

#![forbid(unsafe_code)]

pub mod agent;
/// PulseAudio microphone and playback backends
#[cfg(feature = "pulse")]
pub mod audio;
pub mod capture;
pub mod config;
pub mod connectivity;
pub mod error;
/// Gemini Live wire types
pub mod gemini;
pub mod gemini_client;
pub mod pcm;
pub mod playback;
pub mod session;
pub mod stage;
#[cfg(test)]
mod testing;
pub mod transport;

pub use agent::{Activity, Command, Conversation, ConversationParts, Notice, Snapshot};
pub use error::{Error, Result};
