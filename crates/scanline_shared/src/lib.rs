mod arena;
mod args;

pub use arena::{Arena, ArenaError};
pub use args::GlobalArgs;
