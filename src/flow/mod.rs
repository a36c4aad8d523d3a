//! Per-connection byte budget.
//!
//! Every outbound transfer acquires a [Permit] sized to its payload before it is put on the
//! wire. When the window is exhausted, requests wait in a priority queue and are granted
//! strictly in queue order as budget is released.
mod controller;

pub use controller::{FlowController, Pending, Permit};
