//! Worker-side block generation & storage.

mod generator;
mod handler;
#[cfg(test)]
mod handler_test;

pub use generator::{BlockGenerator, BlockGeneratorListener, GeneratorState};
pub use handler::{new_block_handler, DirectBlockHandler, ReceivedBlockHandler, WalBlockHandler};
