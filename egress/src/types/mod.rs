//! Domain types shared across the batch router and the warehouse uploader.

mod destination;
mod job;
mod schema;

pub use destination::*;
pub use job::*;
pub use schema::*;
