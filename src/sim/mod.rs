pub mod config;
pub mod page_table;
pub mod perf_log;
pub mod simulator;
pub mod synthetic;
pub mod top;
pub mod trace;

#[cfg(test)]
mod tests;
