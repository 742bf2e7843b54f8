//! Manifest loaders for StagFS.
//!
//! This crate provides implementations of the
//! [`ManifestLoader`](stagfs_core::ManifestLoader) trait:
//!
//! - [`StagfileLoader`]: JSON `*.stag` manifests
//! - [`TomlStagfileLoader`]: TOML `*.stag.toml` manifests
//!
//! Use the [`LoaderRegistry`] to route a file to the right loader by name.

pub mod manifest;
pub mod registry;
pub mod stagfile;

pub use manifest::{IntoManifestValue, ManifestDocument, SELF_TARGET};
pub use registry::LoaderRegistry;
pub use stagfile::{StagfileLoader, TomlStagfileLoader};
