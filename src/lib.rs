pub mod admission;
pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use error::RequestError;
pub use service::RequestService;
