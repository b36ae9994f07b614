//! Store implementations shipped with the crate.

mod memory;

pub use memory::{
    InMemoryBackupCodeStore, InMemoryLinkTokenStore, InMemoryOAuthStateStore,
    InMemorySessionStore, InMemoryTotpSecretStore,
};
