//! KREIOS-RS: driver core for the SPECS KREIOS-150 momentum microscope
//!
//! The analyzer is reached through a SpecsLab Prodigy server speaking the
//! text-based "Remote In" protocol over a single TCP connection. This crate
//! provides the protocol client and the acquisition orchestrator that turn
//! control-system commands into 1-D spectra, 2-D images and 3-D volumes.

pub mod acquisition;
pub mod client;
pub mod common;
pub mod config;
pub mod protocol;
pub mod spectrum;
pub mod store;
