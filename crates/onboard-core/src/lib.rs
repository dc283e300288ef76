//! Core types for appliance onboarding.
//!
//! This crate provides the foundational types shared by the REST client and
//! the onboarding engine:
//!
//! - **Identifiers**: Strongly-typed IDs for license pools, pool members
//!   (license assignments) and remote transactions
//! - **Parse errors**: [`IdError`] for malformed identifiers
//!
//! # Example
//!
//! ```
//! use onboard_core::{PoolId, TransactionId};
//!
//! let pool_id: PoolId = "9f2c8a4e-1b3d-4c5e-8f6a-7b8c9d0e1f2a".parse().unwrap();
//! let transaction_id = TransactionId::new(1_516_212_321_123_456);
//!
//! assert_eq!(transaction_id.to_string(), "1516212321123456");
//! assert_eq!(pool_id.to_string(), "9f2c8a4e-1b3d-4c5e-8f6a-7b8c9d0e1f2a");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{IdError, MemberId, PoolId, TransactionId};
