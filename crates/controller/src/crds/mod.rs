pub mod common;
pub mod environment;
pub mod runnerpool;

pub use common::*;
pub use environment::*;
pub use runnerpool::*;
