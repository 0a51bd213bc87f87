//! Storage module for local contacts persistence
//!
//! Uses sled embedded database for fast, reliable storage.

pub mod contacts;

pub use contacts::{ContactsError, ContactsStore, CustomerMeta, SupplierList};
