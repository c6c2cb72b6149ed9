pub mod error;
pub mod notify;
pub mod ownership;
pub mod policy;
pub mod repository;
pub mod service;
pub mod transfer;
pub mod utils;
