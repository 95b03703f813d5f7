pub mod broker;
pub mod frame;
pub mod memory;
pub mod tcp;

pub use self::broker::Broker;
pub use self::memory::MemoryTransport;
pub use self::tcp::{TcpTransport, TcpTransportBuilder};
