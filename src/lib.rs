//! Real-time prediction-slip tracking engine.
//!
//! Reconciles three eventually-consistent sources (the push channel, the
//! enrichment API, and on-chain settlement reads) into one authoritative
//! status per slip.

pub mod chain;
pub mod config;
pub mod decode;
pub mod enrichment;
pub mod poll;
pub mod rollover;
pub mod slips;
pub mod ws;
