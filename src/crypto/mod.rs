mod engine;

pub use engine::{fingerprint, CryptoEngine};
