//! Shared data models for the aggregator

mod admission;
mod descriptor;
mod discovery;
mod identity;
mod query;
mod status;

pub use admission::*;
pub use descriptor::*;
pub use discovery::*;
pub use identity::*;
pub use query::*;
pub use status::*;
