//! Encrypted credentials store.
//!
//! Secret values referenced from a deployment definition as `(secret)"KEY"`
//! are looked up here. The store is decrypted at most once per run, on first
//! lookup, and the resolver is dropped with the run.

mod cipher;
mod secret;
mod store;

pub use cipher::{generate_key, open, seal};
pub use secret::SecretString;
pub use store::{
    CredentialResolver, CredentialSource, DEFAULT_ENV_KEY, DEFAULT_KEY_PATH, DEFAULT_STORE_PATH,
};
