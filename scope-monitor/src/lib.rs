//! # scope-monitor
//!
//! Headless companion to `scope-core`: connects to a telescope's text
//! channel (and optionally its imaging channel), logs events and frame
//! activity, and prints a periodic status summary until stopped.

pub mod config;
pub mod monitor;
