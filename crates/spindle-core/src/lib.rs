//! # spindle-core — Trait definitions for the spindle reactor
//!
//! This crate defines the trait boundaries for every axis of variability
//! in the spindle system. Each trait models one capability dimension:
//! where application work runs ([`worker::TaskPool`]), where diagnostics
//! go ([`diag::DiagnosticSink`]), and how connection establishment is
//! observed ([`completion::Completion`]).
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The reactor crates depend on traits from this crate, never on concrete
//! types. Swapping implementations is a one-line change at construction
//! time.

pub mod completion;
pub mod diag;
pub mod error;
pub mod worker;
