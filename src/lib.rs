pub mod config;
pub mod daemon;
pub mod editor;
pub mod editor_protocol;
pub mod guard;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod status;
