//! Thin per-operation adapters: validate the caller's input, ask the
//! admission gate, then speak to the transport.

pub mod chat;
pub mod transcription;
