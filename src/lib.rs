pub mod config;
pub mod core;
pub mod input;
pub mod playback;
pub mod sink;
