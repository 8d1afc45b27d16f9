//! Application drivers plugged into the batch submitter loop

pub mod disburser;

pub use disburser::{DisburserDriver, DisburserDriverConfig};
