// # ACME Adapters
//
// Concrete implementations of the two certificate-authority-facing
// capabilities the challenge coordinator consumes:
//
// - `InstantAcmeClient`: `AcmeClient` over `instant-acme` (account
//   bootstrap, orders, DNS-01 challenges, finalize, download)
// - `DnsPropagationChecker`: `PropagationChecker` over `hickory-resolver`
//   TXT lookups against public resolvers

pub mod client;
pub mod propagation;

pub use client::{AcmeAccountConfig, AcmeDirectory, InstantAcmeClient};
pub use propagation::{DnsPropagationChecker, PropagationConfig};
