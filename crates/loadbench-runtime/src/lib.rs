pub mod batcher;
pub mod item;
pub mod queue_runner;
pub mod results;
pub mod runner;
pub mod worker;

pub use batcher::*;
pub use item::*;
pub use queue_runner::*;
pub use results::*;
pub use runner::*;
pub use worker::*;
