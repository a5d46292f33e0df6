pub mod audit;
pub mod backend;
pub mod cli;
pub mod utils;
