// THEORY:
// This file is the main entry point for the `zebra_noise` library crate.
// It exposes the `Stimulus` façade from `pipeline` together with the configuration
// and result types a caller needs. The components behind it (`core_modules`) stay
// public so that embedders can swap the noise sampler, the cache store or the video
// encoder, but a typical caller never has to touch them.

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use error::{ConfigError, Result, StimulusError};
pub use pipeline::{Stimulus, StimulusConfig};
