pub mod fifo;
pub mod urb;

pub use fifo::*;
