//! Container registry access: pull tokens, manifests and layer blobs.

mod client;
mod reference;
mod token;

pub use client::{layer_digests, verify_digest, LayerStream, RegistryClient, MANIFEST_ACCEPT};
pub use reference::{repository_path, DistributionPackage};
pub use token::{pull_scope, PullAuth, TokenProvider};
