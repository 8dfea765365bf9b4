pub mod builder;
pub mod client;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod profile;
pub mod qr;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod signature;
pub mod sled_store;
pub mod store;
pub mod timestamp;
pub mod utils;
pub mod verify;
pub mod xml;

pub use error::{ValidationError, VerifactuError, VerifactuResult};
pub use record::FiscalRecord;
pub use service::SubmissionService;
