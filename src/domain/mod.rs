//! Core domain types shared across the tracer and the UI.

pub mod errors;

pub use errors::TraceError;
