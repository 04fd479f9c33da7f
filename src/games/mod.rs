//! Reference game implementations.
//!
//! These exist so the engine can be exercised, tested, and benchmarked
//! without a real rules library. Production users implement
//! [`GameState`](crate::game::GameState) for their own game.

pub mod gridgo;
