//! Field-level scoring of extraction results against verified ground truth
//! and the per-variant metric roll-up.

pub mod aggregate;
pub mod compare;
pub mod error;
pub mod normalize;
pub mod runner;
pub mod score;

#[cfg(test)]
mod tests;
