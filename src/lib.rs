pub mod config;
pub mod crypto;
pub mod error;
pub mod evictor;
pub mod forwarding;
pub mod keyring;
pub mod net;
pub mod peers;
pub mod receipts;
pub mod store;
pub mod substrate;
pub mod sweeper;
pub mod types;

pub use config::{NodeConfig, Role, RolePreset};
pub use crypto::{sha3, verify, Keypair};
pub use error::{Result, SubstrateError};
pub use store::Storage;
pub use substrate::Substrate;
pub use types::*;
