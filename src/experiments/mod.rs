//! Demo glue: a built-in catalog, a toy network to drive, and a small assay.

pub mod assays;
pub mod assoc_net;
pub mod catalog;

pub use assoc_net::{AssocNetConfig, AssociativeNet};
pub use catalog::{builtin_catalog, builtin_document, PARTIAL_RUN, RENEWAL_RUN};
