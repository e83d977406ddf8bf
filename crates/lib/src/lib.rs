//! rolebuild-lib: build orchestration for role-based container images
//!
//! This crate turns per-host role configuration into built and pushed images:
//! - `recipe`: renders the build recipe from a unit's roles, volumes, ports and add-ons
//! - `context`: assembles the deterministic tar build context for a unit
//! - `unit`: the `BuildUnit` and its lifecycle state machine
//! - `daemon`: the image daemon seam and its progress stream reader
//! - `execute`: the pre-build fan-out, bounded worker pool and fan-in

pub mod consts;
pub mod context;
pub mod daemon;
pub mod execute;
pub mod inventory;
pub mod license;
pub mod loaders;
pub mod recipe;
pub mod settings;
pub mod unit;
pub mod util;
