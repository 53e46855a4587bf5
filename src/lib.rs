#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod config;
pub mod output;
pub mod pattern;
pub mod protocol;
pub mod reassembly;
pub mod service;
pub mod session;
pub mod store;
pub mod tls;
