pub mod api;
pub mod config;
pub mod detector;
pub mod farmer;
pub mod hotkeys;
pub mod input;
pub mod launcher;
pub mod logging;
pub mod screen;
pub mod session;
pub mod state;
