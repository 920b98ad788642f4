//! Render process management for the VRender backend.
//!
//! This crate provides:
//! - A builder for the AI video generation command line
//! - Stdout progress parsing and stderr failure classification
//! - Per-process CPU/memory sampling
//! - [`ProcessSupervisor`], which spawns, monitors, times out and terminates render processes
//! - Output artifact verification

pub mod classify;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod fs_utils;
pub mod progress;
pub mod stats;
pub mod supervisor;

pub use classify::{classify_stderr, StderrClass};
pub use command::{check_render_command, GenerationCommand};
pub use config::SupervisorConfig;
pub use error::{MediaError, MediaResult};
pub use events::{LimitViolation, ProcessEvent, ProcessOutcome, StopReason};
pub use fs_utils::verify_output;
pub use progress::{parse_output_line, OutputEvent};
pub use supervisor::{ProcessHandle, ProcessLauncher, ProcessSupervisor, StartOptions};
