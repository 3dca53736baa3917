//! Protocol plumbing for the Modbus/TCP connection.

pub mod modbus;

pub use modbus::{GuardedClient, ModbusTransport, TcpTransport};
