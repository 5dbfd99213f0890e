pub mod account;
pub mod bundler;
pub mod config;
pub mod confirm;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod gas;
pub mod persist;
pub mod pipeline;
pub mod service;
pub mod sponsor;
pub mod store;
pub mod submit;
pub mod types;
pub mod value;

#[cfg(test)]
mod testing;

pub use error::UserOpError;
pub use service::UserOps;
