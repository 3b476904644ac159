//! Streamguard-Common: shared identifiers, enums, and errors.
//!
//! - **Typed IDs**: request, correlation, and stream identifiers
//! - **Core Types**: outcomes, zones, media kinds, and stream verdicts
//! - **Error Handling**: common error type and result alias
//!
//! # Examples
//!
//! ```
//! use streamguard_common::{Outcome, RequestId, Zone};
//!
//! let probe = RequestId::liveness_probe(1);
//! assert!(probe.is_liveness_probe());
//!
//! let zone: Zone = "neutral".parse().unwrap();
//! assert_eq!(zone.to_string(), "neutral");
//! assert_eq!(Outcome::Block.to_string(), "block");
//! ```

pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
