//! Fan-out of payloads to a snapshot of peers
//!
//! Every send runs concurrently with its own deadline, so one slow or broken
//! peer never delays delivery to the others. Failures are collected into a
//! [`DeliveryReport`] instead of aborting the fan-out.
//!
//! # Zero-Copy Design
//!
//! Payloads are `bytes::Bytes`; each recipient gets a reference-counted clone
//! of the same allocation.

pub mod broadcast;

pub use broadcast::{deliver, deliver_one, DeliveryReport, Recipient};
