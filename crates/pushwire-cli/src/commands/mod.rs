//! CLI command implementations

mod decode;
mod info;
mod stream;

pub use decode::decode;
pub use info::info;
pub use stream::{stream, StreamArgs};
