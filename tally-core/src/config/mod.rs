//! Shared runtime configuration.
//!
//! This module introduces types to facilitate the configuration of the
//! driver runtime.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes so it can be flattened into a binary's command line.
//! - [`Serializer`]: Specifies the serialization format to use for calls and
//!   contributions.
//!
//! # Usage:
//! The [`Config`] struct can be passed to
//! [`Runtime::from_config`](crate::runtime::Runtime::from_config) to construct
//! a [`Runtime`](crate::runtime::Runtime) with an emulated worker pool.

use clap::{Args, ValueEnum};

const DEFAULT_NUM_WORKERS: usize = 4;
const HELP_HEADING: &str = "Tally options";

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Config {
    /// Determines the serialization format to be used.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Specifies the number of worker processes to emulate. With zero workers
    /// the driver executes every chunk itself.
    #[arg(long, short, help_heading = HELP_HEADING, env = "TALLY_NUM_WORKERS", default_value_t = DEFAULT_NUM_WORKERS)]
    pub num_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serializer: Default::default(),
            num_workers: DEFAULT_NUM_WORKERS,
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}
