pub mod auth;
pub mod backend;
pub mod cache;
pub mod device;
pub mod error;
pub mod factory;
pub mod mqtt;
pub mod proto;
pub mod rest;
pub mod signature;

pub use backend::Backend;
pub use error::ApiError;
pub use factory::create_backend;
