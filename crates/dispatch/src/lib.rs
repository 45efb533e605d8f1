//! Transfer dispatch for the CNC file-transfer agent.
//!
//! [`TransferDispatcher`] is the queue's [`MessageHandler`]: every message
//! is decoded, validated, carried out under the configured share
//! authenticator and reported to the control plane.
//!
//! # Policy
//!
//! - Undecodable body: dead-lettered, nothing reported.
//! - Invalid request: `Failed` reported, then dead-lettered.
//! - Transfer error: `Failed` reported, message abandoned for redelivery.
//! - Shutdown mid-transfer: message abandoned, nothing reported.
//!
//! [`MessageHandler`]: cnc_agent_queue::MessageHandler

pub mod dispatcher;
pub mod error;

pub use dispatcher::{Outcome, REASON_INVALID, REASON_MALFORMED, TransferDispatcher};
pub use error::DispatchError;
