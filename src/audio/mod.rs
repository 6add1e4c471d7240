//! Audio capture, noise conditioning, output graph and playback via cpal.

pub mod capture;
pub mod dsp;
pub mod mixer;
pub mod noise_gate;
pub mod playback;
