//! Wire bridge between the supervisor and the worker subprocess.
//!
//! One frame is one UTF-8 JSON value followed by a single line-feed byte.
//! Both directions of the pipe use the same framing; there is no length
//! prefix, no compression, and no multiplexing.

pub mod codec;
