//! Symbol package ingestion and create-only PDB storage.
//!
//! An uploaded `.snupkg` is validated against the extension allow-list,
//! matched to a registered package, and each portable PDB inside it is
//! stored once under its SSQP key.

pub mod archive;
pub mod config;
pub mod indexing;
pub mod metrics;
pub mod pdb;
pub mod registry;
pub mod server;
pub mod storage;
pub mod utils;

pub use indexing::{SymbolIndexingResult, SymbolIndexingService};
pub use pdb::{derive_key, DebugFile, PdbSignature, SymbolKey};
pub use registry::{PackageExistenceGate, PackageRegistration, PackageRegistry};
pub use storage::{Content, StorageEngine, StorageError};
