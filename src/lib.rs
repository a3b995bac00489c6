pub mod args;
pub mod config;
pub mod control;
pub mod daemon;
pub mod fs_util;
pub mod hub;
pub mod openbao;
pub mod orchestrator;
pub mod pki;
pub mod retry;
pub mod secrets;
pub mod types;
pub mod workflows;

pub use args::Args;
