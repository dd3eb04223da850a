//! Readers over range-addressable objects

mod buffered;
mod raw;

pub use buffered::{BufferedReader, Lines};
pub use raw::RawReader;
