pub mod api;
pub mod cancel;
pub mod candidate;
pub mod client;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod dto;
pub mod error;
pub mod paths;
pub mod preview;
pub mod projection;
pub mod scheduler;
