//! Generic Attribute Profile data model ([Vol 3] Part G).
//!
//! Attributes are addressed by [`Handle`]. A peripheral's attribute list is
//! described by an immutable [`Schema`], which is shared with every client
//! that discovers its services. Attribute values live in a [`ValueStore`]
//! owned by the peripheral.

pub use {consts::*, handle::*, schema::*, store::*, uuid::*};

mod consts;
mod handle;
mod schema;
mod store;
mod uuid;
