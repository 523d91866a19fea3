//! Test fixtures

mod two_node;

pub use two_node::{TwoNodeFixture, pattern, wait_for};
