//! Wire protocols spoken over the bridge connections

pub mod modbus;
