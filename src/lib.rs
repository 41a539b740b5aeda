//! certdist - TLS certificate distribution
//!
//! A central server holds the certificates issued for many domains (typically a
//! certbot `live/` tree). Clients on other hosts ask it for the certificate of a
//! domain; the server answers with every file of the matching directory, packed
//! into a tar.gz archive and encrypted to the requester's public key. Only keys
//! on the server's allow-list receive anything.
//!
//! # Overview
//!
//! ```text
//! client                                server
//!   | POST /api/v1/certificate-request    |
//!   |  {domain, public key, expiration} ->| scan + resolve   (404)
//!   |                                     | freshness        (304)
//!   |                                     | allow-list       (403)
//!   |<- encrypted tar.gz  (200)           | package
//!   | decrypt, unpack, renew commands     |
//! ```
//!
//! # Architecture
//!
//! - [`store`]: certificate directory scanning and PEM classification
//! - [`resolver`]: domain to certificate set lookup
//! - [`encryption`]: X25519 recipient keys and the encrypted envelope
//! - [`packager`]: archive building and hardened unpacking
//! - [`authorization`]: constant-time allow-list check
//! - [`protocol`]: endpoints and the JSON request body
//! - [`webserver`]: the axum server and its request pipeline
//! - [`client`]: polling loop and installation
//! - [`hooks`]: post-install shell commands
//! - [`configs`]: TOML configuration and validation
//! - [`logging`]: tracing subscriber setup

pub mod authorization;
pub mod client;
pub mod configs;
pub mod encryption;
pub mod hooks;
pub mod logging;
pub mod packager;
pub mod protocol;
pub mod resolver;
pub mod store;
pub mod webserver;

#[cfg(test)]
mod test_support;
