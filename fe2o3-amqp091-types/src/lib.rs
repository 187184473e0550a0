#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Implements AMQP 0-9-1 data types: field values and tables, method identities
//! and arguments, and the method table that describes how each method is laid out
//! on the wire.
//!
//! The method table is a read-only lookup. [`protocol::Amqp091`] carries the
//! classes a client needs (connection, channel, exchange, queue, basic, confirm, tx);
//! other vocabularies can be plugged in by implementing [`method::MethodTable`].

pub mod constants;
pub mod error;
pub mod method;
pub mod primitives;
pub mod protocol;

pub use error::{DecodeError, EncodeError};
