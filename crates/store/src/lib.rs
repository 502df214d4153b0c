pub mod error;
pub mod models;
mod schema;
mod store;

pub use error::StoreError;
pub use models::*;
pub use store::Store;
