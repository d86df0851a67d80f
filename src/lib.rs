//! Content-addressed, versioned file storage.
//!
//! The [`fileset`] module is the storage engine: immutable sets of
//! path-indexed entries with lazy merge, compaction, and TTL-based GC.
//! The [`repo`] module builds repos, branches, and a provenance-linked
//! commit DAG on top of it, with optimistic metadata transactions from
//! [`meta`].

pub mod fileset;
pub mod glob;
pub mod id;
pub mod meta;
pub mod repo;
