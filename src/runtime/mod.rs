//! Stream plumbing: dialing, and the traits that inject an externally configured secure
//! transport.

mod stream;

pub(crate) use stream::AsyncStream;
pub use stream::{RawStream, TlsConnect};
