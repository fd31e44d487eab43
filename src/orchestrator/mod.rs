//! Application-level orchestration.
//!
//! This module owns run lifecycle control (signals, cancellation, pause) and
//! post-run processing such as report files and exports. UI/CLI layers call
//! into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use post_process::process_run_completion;
