pub mod database;
pub mod error;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use store::{EventStore, StoreTxn};
