#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Consistent tensors for Burn: one logical tensor distributed over a mesh of devices.
//!
//! A tensor's distribution assigns one [`Sbp`](sharding::Sbp) descriptor to every mesh axis:
//! split along a tensor dim, broadcast, or partial sum. [`redistribute`] moves a
//! [`ConsistentTensor`] from one distribution to another by planning a sequence of per-axis
//! transforms and executing them with collective communication.

extern crate alloc;

mod config;
mod error;
mod fill;
mod reconstruct;
mod tensor;

pub mod boxing;
pub mod collective;
pub mod sharding;

pub use boxing::redistribute;
pub use config::*;
pub use error::*;
pub use fill::*;
pub use reconstruct::*;
pub use tensor::*;
