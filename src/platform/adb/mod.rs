//! Platform backend for a device reached over `adb`.

mod client;
mod heuristics;

pub use client::{AdbClient, AdbShell};
pub use heuristics::{DialogScreen, Point, ScreenInference};
