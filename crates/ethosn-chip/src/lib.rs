//! Silicon model for the Arm Ethos-N78 NPU.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the silicon: SRAM and engine geometry, brick and FCAF cell
//! shapes, the PLE kernel table, and the command-stream version triple.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`caps`] | Hardware capability descriptor — variants and blob parsing |
//! | [`geometry`] | Brick group, FCAF cell shapes, MCE block configs |
//! | [`ple`] | PLE kernel table — operations, tags, SRAM sizes |
//! | [`version`] | Command-stream / library version triple and ranges |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod caps;
pub mod geometry;
pub mod ple;
pub mod version;

pub use caps::{EthosN78Variant, HardwareCapabilities};
pub use geometry::{BlockConfig, BRICK_GROUP_SHAPE, FCAF_DEEP_CELL, FCAF_WIDE_CELL};
pub use ple::{PleKernelId, PleOperation};
pub use version::{Version, VersionRange};
