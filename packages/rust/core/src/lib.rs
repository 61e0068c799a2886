//! Build orchestration for webapk.
//!
//! This crate ties together staging, template patching, the external build
//! tool, and completion notification into the per-job pipeline
//! (see [`pipeline::Pipeline`]).

pub mod fsutil;
pub mod invoker;
pub mod layout;
pub mod locator;
pub mod notifier;
pub mod patcher;
pub mod pipeline;
pub mod registry;
pub mod stager;

#[cfg(test)]
pub(crate) mod testutil;

pub use locator::ArtifactLocator;
pub use notifier::Notifier;
pub use pipeline::Pipeline;
