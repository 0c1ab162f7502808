#![allow(clippy::unwrap_used, clippy::expect_used)]

pub mod fake_cluster;
pub mod harness;
pub mod memory_scratch;

pub use fake_cluster::{Completion, FakeCluster};
pub use harness::TestContext;
pub use memory_scratch::MemoryScratch;
