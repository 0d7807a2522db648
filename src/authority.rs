//! Authority lifecycle: creating self-signed authority pairs and deciding which
//! stored authority signs leaf certificates and which signs the CRL.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::X509;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use tracing::{debug, info};

use crate::config::{AUTHORITY_CN, PkiConfig};
use crate::error::{PkiError, Result};
use crate::pair::{KeyCertPair, serial_to_asn1};
use crate::store::{KeyStorage, SerialAllocator};

/// Chooses among stored authority pairs.
///
/// The two rules are separate on purpose: leaf certificates are signed by the
/// most recently created authority, CRLs by the authority with the highest
/// serial. They agree as long as every authority is created through the same
/// serial allocator.
pub trait AuthoritySelector: Send + Sync {
    /// Authority used to sign new leaf certificates.
    fn signing_authority(&self) -> Result<KeyCertPair>;

    /// Authority used to sign the CRL.
    fn crl_authority(&self) -> Result<KeyCertPair>;

    /// Every stored authority, newest first.
    fn authorities(&self) -> Result<Vec<KeyCertPair>>;
}

/// [`AuthoritySelector`] reading authority pairs from key storage under the
/// common name `"ca"`.
pub struct StoredAuthorities {
    storage: Arc<dyn KeyStorage>,
}

impl StoredAuthorities {
    pub fn new(storage: Arc<dyn KeyStorage>) -> Self {
        Self { storage }
    }
}

impl AuthoritySelector for StoredAuthorities {
    fn signing_authority(&self) -> Result<KeyCertPair> {
        let pair = self
            .storage
            .get_last_by_cn(AUTHORITY_CN)
            .map_err(|e| PkiError::storage("fetching CA", e))?;
        debug!(serial = %pair.serial(), "selected signing authority");
        Ok(pair)
    }

    fn crl_authority(&self) -> Result<KeyCertPair> {
        let pair = self
            .storage
            .get_by_cn(AUTHORITY_CN)
            .map_err(|e| PkiError::storage("fetching CA certs for signing CRL", e))?
            .into_iter()
            .max_by(|a, b| a.serial().cmp(b.serial()))
            .ok_or(PkiError::NotFound("fetching CA certs for signing CRL"))?;
        debug!(serial = %pair.serial(), "selected CRL authority");
        Ok(pair)
    }

    fn authorities(&self) -> Result<Vec<KeyCertPair>> {
        let mut pairs = self
            .storage
            .get_by_cn(AUTHORITY_CN)
            .map_err(|e| PkiError::storage("listing CA certs", e))?;
        pairs.reverse();
        Ok(pairs)
    }
}

/// Latest year a certificate or CRL time can carry (four digit GeneralizedTime).
const MAX_X509_YEAR: i32 = 9999;

/// `now + lifetime_days`, or `InvalidConfig` when that is not a representable X.509 time.
pub(crate) fn lifetime_end(
    now: DateTime<Utc>,
    lifetime_days: u32,
    what: &str,
) -> Result<DateTime<Utc>> {
    Duration::try_days(i64::from(lifetime_days))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .filter(|end| end.year() <= MAX_X509_YEAR)
        .ok_or_else(|| {
            PkiError::InvalidConfig(format!("{what} of {lifetime_days} days is out of range"))
        })
}

/// `[now - backdate, now + lifetime]` as certificate times.
pub(crate) fn validity_window(
    now: DateTime<Utc>,
    backdate_minutes: u32,
    lifetime_days: u32,
) -> Result<(Asn1Time, Asn1Time)> {
    let not_before = Duration::try_minutes(i64::from(backdate_minutes))
        .and_then(|backdate| now.checked_sub_signed(backdate))
        .filter(|start| start.year() >= 0)
        .ok_or_else(|| {
            PkiError::InvalidConfig(format!(
                "backdate of {backdate_minutes} minutes is out of range"
            ))
        })?;
    let not_after = lifetime_end(now, lifetime_days, "certificate lifetime")?;
    Ok((asn1_time(not_before)?, asn1_time(not_after)?))
}

fn asn1_time(time: DateTime<Utc>) -> Result<Asn1Time> {
    Asn1Time::from_str_x509(&time.format("%Y%m%d%H%M%SZ").to_string())
        .map_err(|e| PkiError::generation("encoding validity window", e))
}

pub(crate) fn generate_key(bits: u32) -> std::result::Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(bits)?)
}

/// Creates and rotates self-signed authority pairs.
pub struct AuthorityManager {
    storage: Arc<dyn KeyStorage>,
    serials: Arc<dyn SerialAllocator>,
    selector: Arc<dyn AuthoritySelector>,
    config: Arc<PkiConfig>,
}

impl AuthorityManager {
    pub fn new(
        storage: Arc<dyn KeyStorage>,
        serials: Arc<dyn SerialAllocator>,
        selector: Arc<dyn AuthoritySelector>,
        config: Arc<PkiConfig>,
    ) -> Self {
        Self {
            storage,
            serials,
            selector,
            config,
        }
    }

    /// Generates a new self-signed authority and stores it. The new pair becomes
    /// the signing authority for every issuance that starts after it is stored.
    pub fn create_authority(&self) -> Result<KeyCertPair> {
        let (not_before, not_after) = validity_window(
            Utc::now(),
            self.config.backdate_minutes,
            self.config.authority_lifetime_days,
        )?;
        let pkey = generate_key(self.config.authority_key_bits)
            .map_err(|e| PkiError::generation("generating CA key", e))?;
        let serial = self
            .serials
            .next()
            .map_err(|e| PkiError::allocation("allocating CA serial", e))?;

        let cert = self
            .build_self_signed(&pkey, &serial, &not_before, &not_after)
            .map_err(|e| PkiError::generation("creating CA certificate", e))?;
        let pair = KeyCertPair::encode(&pkey, &cert, AUTHORITY_CN, serial)
            .map_err(|e| PkiError::generation("encoding CA pair", e))?;
        self.storage
            .put(&pair)
            .map_err(|e| PkiError::storage("storing CA pair", e))?;

        info!(serial = %pair.serial(), "created certificate authority");
        Ok(pair)
    }

    /// The pair that signs new leaf certificates; `NotFound` until an authority exists.
    pub fn current_signing_authority(&self) -> Result<KeyCertPair> {
        self.selector.signing_authority()
    }

    fn build_self_signed(
        &self,
        pkey: &PKey<Private>,
        serial: &num_bigint::BigUint,
        not_before: &Asn1Time,
        not_after: &Asn1Time,
    ) -> std::result::Result<X509, ErrorStack> {
        let name = self.config.subject.build_name(AUTHORITY_CN)?;
        let serial = serial_to_asn1(serial)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(pkey)?;
        builder.set_not_before(not_before)?;
        builder.set_not_after(not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(pkey, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}
