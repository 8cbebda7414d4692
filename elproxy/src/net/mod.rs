//! Wire-facing modules: the framed client protocol, the per-slot relay and
//! the acceptor/worker machinery driving it.

pub mod acceptor;
pub mod buffer;
pub mod frame;
pub mod relay;
pub mod worker;
