pub use logger::*;

pub mod logger;
