pub mod commands;
pub mod connection;
pub mod device;
pub mod failure;
pub mod modbus;
pub mod output;
pub mod registers;
pub mod throttle;
pub mod transport;
