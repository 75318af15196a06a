//! Protocol module - register map and feature report framing.

pub mod constants;
pub mod report;

pub use constants::*;
pub use report::{RegisterReport, RegisterSpace, ReportError, burst_report};
