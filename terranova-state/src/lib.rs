//! Resource state for the Terranova apply engine.
//!
//! The engine records what it is about to do to a remote resource before doing
//! it ([`StateStore::record_pre_create`], [`StateStore::record_pre_update`]),
//! and confirms it afterwards ([`StateStore::finalize`],
//! [`StateStore::save_typed_state`]). Each step is written to the state file
//! before the call returns, so a run that dies in between leaves an
//! *unreconciled* entry behind instead of a silent guess.
//!
//! The file format is documented on [`Database`].

pub mod codec;
pub mod database;
pub mod error;
pub mod lock;
pub mod store;

pub use database::{Database, EntryStatus, ResourceEntry, ResourceKey};
pub use error::{DecodeError, Error, ErrorKind, Result};
pub use store::StateStore;
