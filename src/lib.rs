//! Build, sponsor, sign and submit ERC-4337 (EntryPoint v0.6) user operations for
//! SimpleAccount smart accounts.

pub mod batch;
pub mod builder;
pub mod bundler;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod gas;
pub mod owner;
pub mod paymaster;
pub mod placeholder;
mod rpc;
pub mod types;

pub use batch::{encode_batch, Call, EncodedBatch};
pub use builder::{BuilderSettings, Stage, UserOpBuilder, UserOpDraft};
pub use bundler::{Bundler, BundlerClient, ReceiptPolling, Submitter, UserOpHandle, UserOpReceipt};
pub use chain::{ChainState, RpcChain};
pub use config::{Config, ConfigFile};
pub use error::{Result, UserOpError};
pub use fees::{estimate_fees, FeeSnapshot, GasFees};
pub use paymaster::{PaymasterClient, PaymasterContext, PaymasterSponsor, SponsorshipResult};
pub use types::{SignedUserOperation, UserOperation};
