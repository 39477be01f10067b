//! Library crate for tls-posture-scan: scan orchestration, probe output
//! parsing and report aggregation.
pub mod aggregate;
pub mod ciphers;
pub mod config;
pub mod error;
pub mod inventory;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod probe;
pub mod procs;
pub mod scanner;
pub mod types;
pub mod xmltree;
