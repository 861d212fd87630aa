pub mod opencodelists;

pub use opencodelists::{sync_codelists, OpenCodelistsClient, SyncReport};
