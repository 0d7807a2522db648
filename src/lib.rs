//! # CA-Keeper
//!
//! ## Description
//!
//! Lifecycle manager for a small private certificate authority, built on the OpenSSL crate.
//!
//! The library keeps a set of self-signed authority pairs, issues client and server leaf
//! certificates for mutual TLS, and maintains a single signed certificate revocation list(crl).
//! Keys, certificates and the crl are handled as standard PEM blocks so any X.509 consumer
//! can read them unmodified.
//!
//! This library provides:
//! - Creating (rotating) self-signed authority pairs
//! - Issuing client or server leaf certificates with group tags and a role marker
//! - Reading group tags and the role back out of a certificate
//! - Revoking single serials or every certificate issued for a common name
//! - Checking whether a serial is revoked
//!
//! Persistence is pluggable through three small traits in [`store`]: key storage, a serial
//! allocator and a crl store. In-memory and directory-backed implementations are included.
//!
//! ### Authority selection
//! - New leaf certificates are signed by the most recently created authority
//! - The crl is signed by the authority with the highest serial
//!
//! Both rules agree as long as all authorities are created through the same serial allocator.
//! Replace [`authority::StoredAuthorities`] through [`Pki::with_selector`] to change the policy.
//!
//! ### Concurrency
//! Every operation takes `&self`. Revocations are serialized inside the revocation engine and
//! the crl is written with a compare-and-swap, so concurrent revocations never lose an entry.
//!
//! ## Basic Example creating an authority and issuing certificates
//! ```rust
//! use ca_keeper::{Pki, PkiConfig, Role};
//!
//! let pki = Pki::in_memory(PkiConfig::default().key_bits(2048));
//! let ca = pki.create_authority()?;
//!
//! let server = pki.issue_certificate("svc-a", true, &["web"])?;
//! let cert = server.certificate()?;
//! let ca_key = ca.certificate()?.public_key()?;
//! assert!(cert.verify(&ca_key)?);
//! assert_eq!(pki.extract_role(&cert)?, Role::Server);
//! assert_eq!(pki.extract_groups(&cert)?, vec!["web".to_string()]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Example on how to revoke a certificate
//! ```rust
//! use ca_keeper::{Pki, PkiConfig};
//!
//! let pki = Pki::in_memory(PkiConfig::default());
//! pki.create_authority()?;
//! let client = pki.issue_certificate("svc-b", false, &[])?;
//!
//! assert!(!pki.is_revoked(client.serial()));
//! pki.revoke_one(client.serial())?;
//! assert!(pki.is_revoked(client.serial()));
//!
//! let crl = pki.get_crl()?;
//! assert_eq!(crl.entries().len(), 1);
//! // crl.pem() holds the "X509 CRL" block to publish
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Example keeping the pki in a directory
//! ```rust,no_run
//! use ca_keeper::{Pki, PkiConfig};
//!
//! let config = PkiConfig::from_json_file("./pki/config.json")?;
//! let pki = Pki::open_dir("./pki", config)?;
//! let pair = pki.issue_certificate("svc-c", true, &["ops", "db"])?;
//! pair.save("./certs", "svc-c")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Config
//!
//! Values read from json by [`PkiConfig::from_json_str`], all optional
//! | keyword | description | default |
//! | ----------------------- | ------------------------------------------------------------- | ------------- |
//! | subject | country, state_province, locality, organization, organizational_unit for every certificate | empty |
//! | authority_lifetime_days | validity of a new authority | 3650 |
//! | leaf_lifetime_days | validity of a leaf certificate | 36135 (99 years) |
//! | crl_lifetime_days | time between thisUpdate and nextUpdate of the crl | 36135 |
//! | backdate_minutes | notBefore is set this far in the past | 10 |
//! | authority_key_bits | RSA key size for authorities | 2048 |
//! | leaf_key_bits | RSA key size for leaf certificates | 2048 |
//! | san_ips | IP addresses added to the SAN of every leaf | ["127.0.0.1"] |
//! | group_encoding | `dedicated` or `name_constraints` | dedicated |
//!
//! ### Leaf key usage
//!
//! | role   | key usage                                          | extended key usage |
//! | ------ | -------------------------------------------------- | ------------------ |
//! | client | digital signature, key agreement                   | client auth        |
//! | server | digital signature, key agreement, key encipherment | server auth        |

pub mod authority;
pub mod certificate;
pub mod config;
pub mod crl;
pub mod error;
pub mod pair;
pub mod pki;
pub mod revocation;
pub mod store;

pub use authority::{AuthorityManager, AuthoritySelector, StoredAuthorities};
pub use certificate::{CertificateIssuer, Role, extract_groups, extract_role};
pub use config::{GroupEncoding, PkiConfig, SubjectTemplate};
pub use crl::{RevocationList, RevokedCert};
pub use error::{PkiError, Result, StoreError};
pub use pair::{KeyCertPair, serial_of};
pub use pki::Pki;
pub use revocation::RevocationEngine;
