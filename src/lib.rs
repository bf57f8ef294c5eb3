#![doc = "stage-sync: ship pinned Python dependencies to a Snowflake stage as one importable archive."]

//! The pipeline reads a requirements manifest, downloads platform-pinned
//! distributions with `pip`, zips them deterministically, and `PUT`s the zip
//! onto a stage where UDFs can import it.
//!
//! # Usage
//! Build a [`config::SyncConfig`] (see [`load_config`]) and call
//! [`synchronise::synchronise`] with a [`contract::PackageDownloader`] and a
//! [`contract::StageUploader`].

pub mod archive;
pub mod cli;
pub mod config;
pub mod contract;
pub mod download;
pub mod error;
pub mod load_config;
pub mod manifest;
pub mod synchronise;
pub mod upload;

pub use cli::{run, Cli};
