//! One handle wiring the authority manager, certificate issuer and revocation
//! engine to a shared set of collaborators.

use std::path::Path;
use std::sync::Arc;

use num_bigint::BigUint;
use openssl::x509::X509;
use tracing::info;

use crate::authority::{AuthorityManager, AuthoritySelector, StoredAuthorities};
use crate::certificate::{CertificateIssuer, Role};
use crate::config::PkiConfig;
use crate::crl::RevocationList;
use crate::error::{PkiError, Result};
use crate::pair::KeyCertPair;
use crate::revocation::RevocationEngine;
use crate::store::{
    CrlStore, DirKeyStorage, FileCrlStore, FileSerialAllocator, KeyStorage, MemoryCrlStore,
    MemoryKeyStorage, MemorySerialAllocator, SerialAllocator,
};

const PAIRS_DIR: &str = "pairs";
const SERIAL_FILE: &str = "serial";
const CRL_FILE: &str = "crl.pem";

/// Private PKI backed by one key storage, serial allocator and CRL store.
///
/// All operations take `&self`; a `Pki` can be shared between threads behind an `Arc`.
pub struct Pki {
    authorities: AuthorityManager,
    issuer: CertificateIssuer,
    revocation: RevocationEngine,
    selector: Arc<dyn AuthoritySelector>,
}

impl Pki {
    /// Selects authorities from `storage` with [`StoredAuthorities`].
    pub fn new(
        storage: Arc<dyn KeyStorage>,
        serials: Arc<dyn SerialAllocator>,
        crl_store: Arc<dyn CrlStore>,
        config: PkiConfig,
    ) -> Self {
        let selector = Arc::new(StoredAuthorities::new(storage.clone()));
        Self::with_selector(storage, serials, crl_store, selector, config)
    }

    pub fn with_selector(
        storage: Arc<dyn KeyStorage>,
        serials: Arc<dyn SerialAllocator>,
        crl_store: Arc<dyn CrlStore>,
        selector: Arc<dyn AuthoritySelector>,
        config: PkiConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            authorities: AuthorityManager::new(
                storage.clone(),
                serials.clone(),
                selector.clone(),
                config.clone(),
            ),
            issuer: CertificateIssuer::new(
                storage.clone(),
                serials,
                selector.clone(),
                config.clone(),
            ),
            revocation: RevocationEngine::new(storage, crl_store, selector.clone(), config),
            selector,
        }
    }

    /// Everything kept in memory; serials start at 1.
    pub fn in_memory(config: PkiConfig) -> Self {
        Self::new(
            Arc::new(MemoryKeyStorage::new()),
            Arc::new(MemorySerialAllocator::new()),
            Arc::new(MemoryCrlStore::new()),
            config,
        )
    }

    /// Keeps pairs, the serial counter and the CRL under `root`:
    /// `pairs/`, `serial` and `crl.pem`.
    pub fn open_dir<P: AsRef<Path>>(root: P, config: PkiConfig) -> Result<Self> {
        let root = root.as_ref();
        let storage = DirKeyStorage::new(root.join(PAIRS_DIR))
            .map_err(|e| PkiError::storage("opening key storage", e.into()))?;
        info!(root = %root.display(), "opened PKI directory");
        Ok(Self::new(
            Arc::new(storage),
            Arc::new(FileSerialAllocator::new(
                root.join(SERIAL_FILE),
                BigUint::from(1u32),
            )),
            Arc::new(FileCrlStore::new(root.join(CRL_FILE))),
            config,
        ))
    }

    pub fn create_authority(&self) -> Result<KeyCertPair> {
        self.authorities.create_authority()
    }

    pub fn current_signing_authority(&self) -> Result<KeyCertPair> {
        self.authorities.current_signing_authority()
    }

    /// Every stored authority certificate, newest first, e.g. for a trust bundle.
    pub fn authority_chain(&self) -> Result<Vec<X509>> {
        self.selector
            .authorities()?
            .iter()
            .map(|pair| {
                pair.certificate()
                    .map_err(|e| PkiError::corrupt_authority("listing CA certs", e))
            })
            .collect()
    }

    pub fn issue_certificate(
        &self,
        common_name: &str,
        is_server: bool,
        groups: &[&str],
    ) -> Result<KeyCertPair> {
        self.issuer.issue_certificate(common_name, is_server, groups)
    }

    pub fn extract_groups(&self, cert: &X509) -> Result<Vec<String>> {
        crate::certificate::extract_groups(cert)
    }

    pub fn extract_role(&self, cert: &X509) -> Result<Role> {
        crate::certificate::extract_role(cert)
    }

    pub fn get_crl(&self) -> Result<RevocationList> {
        self.revocation.get_crl()
    }

    pub fn revoke_one(&self, serial: &BigUint) -> Result<()> {
        self.revocation.revoke_one(serial)
    }

    pub fn revoke_all_by_cn(&self, common_name: &str) -> Result<()> {
        self.revocation.revoke_all_by_cn(common_name)
    }

    pub fn is_revoked(&self, serial: &BigUint) -> bool {
        self.revocation.is_revoked(serial)
    }

    pub fn authorities(&self) -> &AuthorityManager {
        &self.authorities
    }

    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    pub fn revocation(&self) -> &RevocationEngine {
        &self.revocation
    }
}
