//! Core of the ACME (Automatic Certificate Management Environment) protocol: both ends of it.
//!
//! This crate speaks the draft-era endpoint set (`new-reg`, `new-app`, `authz`) and contains:
//!
//! - account keys, flattened JWS signing and verification, and CSR checks ([`key`], [`jws`],
//!   [`cert`]);
//! - an anti-replay [`NonceSource`];
//! - a server ([`server::AcmeServer`]) that authenticates signed requests and drives
//!   registrations, authorizations and applications through to issuance;
//! - a client ([`AcmeClient`]) with a nonce-caching signed [`Transport`];
//! - responders for the `http-01`, `dns-01` and `tls-sni-01` challenges ([`validate`]).
//!
//! # Usage
//!
//! ```no_run
//! # async fn run() -> eyre::Result<()> {
//! use acme::{AcmeClient, AccountKey, KeySpec};
//!
//! let key = AccountKey::generate(&KeySpec::p256())?;
//! let client = AcmeClient::new(key, "http://localhost:4000/directory");
//!
//! let reg = client
//!     .new_registration(vec!["mailto:admin@example.com".to_owned()], None)
//!     .await?;
//! println!("registered at {:?}", reg.location);
//! # Ok(())
//! # }
//! ```
//!
//! # Domain Ownership
//!
//! Every authorization carries challenges. The client answers one with its key authorization
//! (`token.thumbprint`), after provisioning the matching proof: a file served over HTTP, a TXT
//! record, or a TLS certificate selected by SNI. See [`validate`].
//!
//! Applications become valid, and get a certificate URL, once every authorization they require
//! is valid. Use [`AcmeClient::poll_application`] to wait for that.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod req;
mod util;

pub mod api;
pub mod cert;
pub mod client;
pub mod error;
pub mod jws;
pub mod key;
pub mod nonce;
pub mod server;
pub mod trans;
pub mod validate;


pub use crate::{
    cert::{check_csr, create_csr_der, create_p256_key, CsrPolicy},
    client::{AcmeClient, Resource},
    error::{ClientError, CryptoError},
    key::{AccountKey, KeySpec},
    nonce::NonceSource,
    trans::Transport,
};
