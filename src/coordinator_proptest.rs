//! Property-based tests for batch selection and backoff.
//!
//! These verify invariants that must hold across a wide range of item
//! sizes, bounds, and failure counts.
