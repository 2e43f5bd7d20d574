pub mod agent;
pub mod clock;
pub mod config;
pub mod conntrack;
pub mod export;
pub mod filter;
pub mod sink;
pub mod tracker;
