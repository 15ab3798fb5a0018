//! keel-core — values, charts, rendering and ordering.
//!
//! Everything in this crate is pure: nothing here talks to a cluster or a
//! registry, so every error it raises happens before any external mutation.
//!
//! # Components
//!
//! - **`values`**: value trees and precedence-ordered merging
//! - **`chart`**: chart loading (`Chart.toml`, `values.yaml`, `templates/`)
//! - **`template`**: placeholder substitution and manifest output
//! - **`resource`**: rendered resources, validation, references
//! - **`order`**: dependency ordering for apply and teardown
//! - **`config`**: environment-scoped configuration
//! - **`image`**: registry artifact references

pub mod chart;
pub mod config;
pub mod error;
pub mod image;
pub mod order;
pub mod resource;
pub mod template;
pub mod values;

pub use chart::{Chart, ChartMetadata, Template};
pub use config::EnvironmentConfig;
pub use error::{CoreError, CoreResult};
pub use image::ImageRef;
pub use order::{order, teardown_order};
pub use resource::{RenderedResource, ResourceId, is_valid_namespace, manifest_digest};
pub use template::{ReleaseContext, render, render_release, to_manifest};
pub use values::{ValueTree, resolve, resolve_for_chart};
