//! Support library for the `jobsync-watch` daemon.

pub mod config;
