//! Process lifecycle helpers for the command-line driver.

pub mod shutdown;
