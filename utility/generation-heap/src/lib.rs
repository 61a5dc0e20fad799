//! Host visible memory suballocation and object reclamation keyed by the gpu timeline.
//!
//! Nothing in this crate is freed directly. The owner hands a value back together with
//! the last command list generation that may still reference it, and the value is only
//! reclaimed once the completed generation has reached that point.

mod deferred;
pub use deferred::*;

mod suballocation;
pub use suballocation::*;
