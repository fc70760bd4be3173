//! Command implementations that are independent of argument parsing.

pub mod init;
