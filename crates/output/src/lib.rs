//! ALSA playback backend for a headless streaming player.
//!
//! The crate owns everything between decoded interleaved stereo `i32`
//! frames and the sound card: device open and parameter negotiation,
//! the output worker thread with its recovery state machine, the frame
//! writer with software gain, DoP and native DSD support, and volume
//! control through either a software gain pair or a hardware mixer
//! element.

pub mod device;
pub mod error;
pub mod mixer;
pub mod ring;
pub mod state;
pub mod types;
pub mod volume;
pub mod worker;
pub mod writer;
