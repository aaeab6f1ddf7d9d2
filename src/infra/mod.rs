//! Infrastructure adapters: persistence backends and the upstream provider client.

pub mod provider;
pub mod store;

pub use provider::{HttpProvider, InMemoryProvider, ProviderApi};
pub use store::{FileStore, InMemoryStore, KvStore};
