//! App bundle handling.
//!
//! [`walker`] discovers nested bundles and produces the leaf-first
//! [`SigningPlan`](walker::SigningPlan); [`code_resources`] emits the
//! `_CodeSignature/CodeResources` plist hashing every resource in a bundle.

pub mod code_resources;
pub mod walker;

pub use code_resources::CodeResourcesBuilder;
pub use walker::{BundleNode, SigningPlan};
