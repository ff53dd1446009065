pub use buffer::MessageBuffer;
pub use ring::RingBuffer;

pub mod buffer;
pub mod ring;
