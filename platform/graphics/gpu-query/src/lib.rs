//! Asynchronous gpu queries.
//!
//! A query records its end into the open command list, remembers which command list
//! that was, and later reads the result back once the device fence has passed it. The
//! device side (submission, fence, query heaps and host readable memory) is abstracted
//! by [`GPUQueryDevice`], [`SimulatedDevice`] is a deterministic implementation of it.

mod async_op;
mod device;
mod kind;
mod query;
mod simulated;
mod time_query;

use std::{ops::Range, sync::Arc};

pub use async_op::*;
use bytemuck::*;
pub use device::*;
pub use kind::*;
pub use query::*;
pub use simulated::*;
use smallvec::SmallVec;
pub use time_query::*;

#[cfg(test)]
mod test;
