// src/lib.rs

//! collage-guard: content fingerprinting, batch partitioning, artifact
//! collision detection and idempotent processing state for per-creator
//! collage production.

pub mod config;
pub mod error;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
