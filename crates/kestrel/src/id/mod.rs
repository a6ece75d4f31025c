mod decode;
mod kestrel;

pub use decode::*;
pub use kestrel::*;
