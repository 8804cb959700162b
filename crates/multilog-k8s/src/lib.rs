//! Kubernetes log source for multilog
//!
//! This crate defines the [`LogSource`] contract the aggregator consumes and
//! provides its Kubernetes implementation, plus kubeconfig context handling.

mod client;
mod error;
mod source;

pub use client::{KubeClient, KubeSource};
pub use error::SourceError;
pub use source::{LineStream, LogRequest, LogSource, LogStream};

// Re-export types that are used in our public API
pub use multilog_types::{ResourceTree, StreamTarget};
