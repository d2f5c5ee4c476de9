//! Submit ComfyUI workflows to a RunPod-style serverless queue, follow
//! the job through its stream and status endpoints, and save the
//! resulting images.

pub mod api;
pub mod client;
pub mod config;
pub mod events;
pub mod io;
pub mod messages;
pub mod orchestrator;
pub mod progress;
pub mod state;
