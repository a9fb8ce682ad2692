//! Block serializer layer for NimbusDB.
//!
//! This crate provides:
//! - The `Serializer` contract the buffer cache writes through
//! - An in-memory implementation with fault injection for tests
//! - A file-backed implementation for single-file block stores

mod file;
mod mem;
mod serializer;

pub use file::{FileSerializer, FileSerializerConfig};
pub use mem::MemSerializer;
pub use serializer::{Serializer, WritePayload};
