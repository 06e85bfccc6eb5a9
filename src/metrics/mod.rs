//! Latency histogram utilities shared by workers and the coordinator.
mod histogram;

#[cfg(test)]
mod tests;

pub use histogram::LatencyHistogram;
