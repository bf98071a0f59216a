pub mod engine;
pub mod error;
pub mod key;
pub mod local;
pub mod blob;

pub use engine::*;
pub use error::StorageError;
pub use key::normalize_key;
pub use local::LocalStorage;
pub use blob::AzureBlobStorage;
