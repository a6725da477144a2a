//! Versioned package repositories.
//!
//! A repository stores, for every package version, an ordered sequence of
//! [`statement::PackageStatement`]s together with named binary resources.
//! The [`repo`] module defines the storage contract and ships in-memory,
//! filesystem and object-store backends that satisfy it identically.

pub mod id;
pub mod prelude;
pub mod repo;
pub mod statement;
