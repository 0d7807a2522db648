use chrono::{DateTime, Datelike, Duration, Utc};
use num_bigint::BigUint;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509Crl};
use x509_parser::parse_x509_crl;
use x509_parser::pem::parse_x509_pem;
use yasna::models::ObjectIdentifier;
use yasna::tags::{TAG_GENERALIZEDTIME, TAG_UTCTIME};
use yasna::{DERWriter, Tag};

use crate::error::{PkiError, Result};
use crate::pair::PEM_CRL;

const SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const CRL_NUMBER: &[u64] = &[2, 5, 29, 20];
const CRL_NUMBER_OID: &str = "2.5.29.20";

/// A single revoked certificate entry in a CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedCert {
    serial: BigUint,
    revocation_date: DateTime<Utc>,
}

impl RevokedCert {
    pub fn new(serial: BigUint, revocation_date: DateTime<Utc>) -> Self {
        Self {
            serial,
            revocation_date,
        }
    }

    pub fn serial(&self) -> &BigUint {
        &self.serial
    }

    pub fn revocation_date(&self) -> DateTime<Utc> {
        self.revocation_date
    }
}

/// Builds and signs a v2 X.509 CRL with a `sha256WithRSAEncryption` signature.
///
/// The issuer is the full subject name of `signer_cert`. Entries are written in
/// the order they were added; deduplication is the caller's job.
pub struct X509CrlBuilder<'a> {
    signer_cert: &'a X509,
    signer_key: &'a PKey<Private>,
    revoked: Vec<RevokedCert>,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    crl_number: BigUint,
}

impl<'a> X509CrlBuilder<'a> {
    /// `this_update` defaults to now, `next_update` to 30 days later and the CRL number to 1.
    pub fn new(signer_cert: &'a X509, signer_key: &'a PKey<Private>) -> Self {
        let now = Utc::now();
        Self {
            signer_cert,
            signer_key,
            revoked: Vec::new(),
            this_update: now,
            next_update: now + Duration::days(30),
            crl_number: BigUint::from(1u32),
        }
    }

    pub fn add_revoked_cert(&mut self, serial: BigUint, revocation_date: DateTime<Utc>) {
        self.revoked.push(RevokedCert::new(serial, revocation_date));
    }

    pub fn extend_revoked<I: IntoIterator<Item = RevokedCert>>(&mut self, entries: I) {
        self.revoked.extend(entries);
    }

    pub fn set_update_times(&mut self, this_update: DateTime<Utc>, next_update: DateTime<Utc>) {
        self.this_update = this_update;
        self.next_update = next_update;
    }

    pub fn set_crl_number(&mut self, crl_number: BigUint) {
        self.crl_number = crl_number;
    }

    /// Returns the DER encoded, signed CRL.
    pub fn build_and_sign(&self) -> std::result::Result<Vec<u8>, ErrorStack> {
        let issuer = self.signer_cert.subject_name().to_der()?;
        let crl_number = yasna::construct_der(|writer| {
            writer.write_bigint_bytes(&self.crl_number.to_bytes_be(), true);
        });

        let tbs = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_u8(1); // v2
                write_signature_algorithm(writer.next());
                writer.next().write_der(&issuer);
                write_time(writer.next(), &self.this_update);
                write_time(writer.next(), &self.next_update);

                // revokedCertificates is omitted, not empty, when nothing is revoked
                if !self.revoked.is_empty() {
                    writer.next().write_sequence_of(|writer| {
                        for revoked in &self.revoked {
                            writer.next().write_sequence(|writer| {
                                writer
                                    .next()
                                    .write_bigint_bytes(&revoked.serial.to_bytes_be(), true);
                                write_time(writer.next(), &revoked.revocation_date);
                            });
                        }
                    });
                }

                writer.next().write_tagged(Tag::context(0), |writer| {
                    writer.write_sequence_of(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer
                                .next()
                                .write_oid(&ObjectIdentifier::from_slice(CRL_NUMBER));
                            writer.next().write_bytes(&crl_number);
                        });
                    });
                });
            });
        });

        let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), self.signer_key)?;
        signer.update(&tbs)?;
        let signature = signer.sign_to_vec()?;

        Ok(yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_der(&tbs);
                write_signature_algorithm(writer.next());
                writer
                    .next()
                    .write_bitvec_bytes(&signature, signature.len() * 8);
            });
        }))
    }
}

fn write_signature_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer
            .next()
            .write_oid(&ObjectIdentifier::from_slice(SHA256_WITH_RSA));
        writer.next().write_null();
    });
}

/// UTCTime through 2049, GeneralizedTime from 2050 on.
fn write_time(writer: DERWriter, time: &DateTime<Utc>) {
    if time.year() < 2050 {
        let time_str = time.format("%y%m%d%H%M%SZ").to_string();
        writer.write_tagged_implicit(TAG_UTCTIME, |writer| {
            writer.write_bytes(time_str.as_bytes());
        });
    } else {
        let time_str = time.format("%Y%m%d%H%M%SZ").to_string();
        writer.write_tagged_implicit(TAG_GENERALIZEDTIME, |writer| {
            writer.write_bytes(time_str.as_bytes());
        });
    }
}

/// Wraps DER bytes in an `X509 CRL` PEM envelope.
pub fn der_to_pem(der: &[u8]) -> Vec<u8> {
    let body = openssl::base64::encode_block(der);
    let mut pem = format!("-----BEGIN {PEM_CRL}-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {PEM_CRL}-----\n"));
    pem.into_bytes()
}

/// A parsed, signed CRL as held by the CRL store.
#[derive(Debug, Clone)]
pub struct RevocationList {
    pem: Vec<u8>,
    der: Vec<u8>,
    entries: Vec<RevokedCert>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    crl_number: Option<BigUint>,
}

impl RevocationList {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, block) = parse_x509_pem(pem).map_err(|e| PkiError::decode("CRL PEM", e))?;
        if block.label != PEM_CRL {
            return Err(PkiError::Decode(format!(
                "expected {PEM_CRL} block, found {}",
                block.label
            )));
        }
        Self::parse(pem.to_vec(), block.contents)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Self::parse(der_to_pem(der), der.to_vec())
    }

    fn parse(pem: Vec<u8>, der: Vec<u8>) -> Result<Self> {
        let (_, crl) = parse_x509_crl(&der).map_err(|e| PkiError::decode("CRL", e))?;

        let entries = crl
            .iter_revoked_certificates()
            .map(|revoked| {
                Ok(RevokedCert::new(
                    BigUint::from_bytes_be(revoked.raw_serial()),
                    timestamp(revoked.revocation_date.timestamp())?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let this_update = timestamp(crl.last_update().timestamp())?;
        let next_update = crl
            .next_update()
            .map(|t| timestamp(t.timestamp()))
            .transpose()?;
        let crl_number = crl
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == CRL_NUMBER_OID)
            .map(|ext| {
                yasna::parse_der(ext.value, |reader| reader.read_bigint_bytes())
                    .map(|(bytes, _)| BigUint::from_bytes_be(&bytes))
                    .map_err(|e| PkiError::decode("CRL number", e))
            })
            .transpose()?;

        Ok(Self {
            pem,
            der,
            entries,
            this_update,
            next_update,
            crl_number,
        })
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn entries(&self) -> &[RevokedCert] {
        &self.entries
    }

    pub fn this_update(&self) -> DateTime<Utc> {
        self.this_update
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    pub fn crl_number(&self) -> Option<&BigUint> {
        self.crl_number.as_ref()
    }

    /// Full precision serial lookup.
    pub fn contains(&self, serial: &BigUint) -> bool {
        self.entries.iter().any(|entry| entry.serial() == serial)
    }

    /// Checks the CRL signature against the public key of `authority`.
    pub fn verify_signature(&self, authority: &X509) -> Result<bool> {
        let crl = X509Crl::from_der(&self.der).map_err(|e| PkiError::decode("CRL", e))?;
        let key = authority
            .public_key()
            .map_err(|e| PkiError::decode("authority public key", e))?;
        crl.verify(&key)
            .map_err(|e| PkiError::decode("CRL signature", e))
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::Decode(format!("timestamp {secs} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::generate_key;
    use crate::config::SubjectTemplate;
    use chrono::{SubsecRound, TimeZone};
    use openssl::x509::extension::BasicConstraints;

    fn dummy_authority() -> (X509, PKey<Private>) {
        let pkey = generate_key(2048).unwrap();
        let name = SubjectTemplate {
            organization: "crl tests".into(),
            ..Default::default()
        }
        .build_name("ca")
        .unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder
            .append_extension(BasicConstraints::new().ca().build().unwrap())
            .unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        (builder.build(), pkey)
    }

    #[test]
    fn test_new_builder() {
        let (cert, key) = dummy_authority();
        let builder = X509CrlBuilder::new(&cert, &key);
        assert_eq!(builder.revoked.len(), 0);
        assert_eq!(builder.crl_number, BigUint::from(1u32));
    }

    #[test]
    fn test_add_revoked_cert() {
        let (cert, key) = dummy_authority();
        let mut builder = X509CrlBuilder::new(&cert, &key);
        let serial = BigUint::from(123u32);
        builder.add_revoked_cert(serial.clone(), Utc::now());
        assert_eq!(builder.revoked.len(), 1);
        assert_eq!(builder.revoked[0].serial, serial);
    }

    #[test]
    fn test_build_sign_and_parse() {
        let (cert, key) = dummy_authority();
        let mut builder = X509CrlBuilder::new(&cert, &key);
        let serial = BigUint::parse_bytes(b"ffffffffffffffffffffffffffffffff01", 16).unwrap();
        let revocation_date = Utc::now().trunc_subsecs(0);
        builder.add_revoked_cert(serial.clone(), revocation_date);
        builder.set_crl_number(BigUint::from(42u32));

        let der = builder.build_and_sign().unwrap();
        let parsed = RevocationList::from_der(&der).unwrap();
        assert_eq!(parsed.entries().len(), 1);
        assert_eq!(parsed.entries()[0].serial(), &serial);
        assert_eq!(parsed.entries()[0].revocation_date(), revocation_date);
        assert_eq!(parsed.crl_number(), Some(&BigUint::from(42u32)));
        assert!(parsed.verify_signature(&cert).unwrap());
    }

    #[test]
    fn test_openssl_accepts_generated_crl() {
        let (cert, key) = dummy_authority();
        let mut builder = X509CrlBuilder::new(&cert, &key);
        builder.add_revoked_cert(BigUint::from(456u32), Utc::now());
        let der = builder.build_and_sign().unwrap();

        let crl = X509Crl::from_pem(&der_to_pem(&der)).unwrap();
        let public_key = cert.public_key().unwrap();
        assert!(crl.verify(&public_key).unwrap());
        assert_eq!(
            crl.issuer_name().to_der().unwrap(),
            cert.subject_name().to_der().unwrap()
        );
        assert_eq!(crl.get_revoked().map(|r| r.len()), Some(1));
    }

    #[test]
    fn test_empty_crl_omits_revoked_sequence() {
        let (cert, key) = dummy_authority();
        let der = X509CrlBuilder::new(&cert, &key).build_and_sign().unwrap();
        let parsed = RevocationList::from_der(&der).unwrap();
        assert!(parsed.entries().is_empty());
        let crl = X509Crl::from_der(&der).unwrap();
        assert_eq!(crl.get_revoked().map_or(0, |r| r.len()), 0);
    }

    #[test]
    fn test_far_future_next_update_round_trips() {
        let (cert, key) = dummy_authority();
        let mut builder = X509CrlBuilder::new(&cert, &key);
        let this_update = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let next_update = Utc.with_ymd_and_hms(2125, 1, 2, 3, 4, 5).unwrap();
        builder.set_update_times(this_update, next_update);
        let parsed = RevocationList::from_der(&builder.build_and_sign().unwrap()).unwrap();
        assert_eq!(parsed.this_update(), this_update);
        assert_eq!(parsed.next_update(), Some(next_update));
    }

    #[test]
    fn test_pem_envelope() {
        let (cert, key) = dummy_authority();
        let der = X509CrlBuilder::new(&cert, &key).build_and_sign().unwrap();
        let pem = der_to_pem(&der);
        let text = String::from_utf8(pem.clone()).unwrap();
        assert!(text.starts_with("-----BEGIN X509 CRL-----\n"));
        assert!(text.lines().all(|line| line.len() <= 64));
        assert_eq!(RevocationList::from_pem(&pem).unwrap().der(), der.as_slice());
    }

    #[test]
    fn test_from_pem_rejects_other_blocks() {
        let (cert, _) = dummy_authority();
        let err = RevocationList::from_pem(&cert.to_pem().unwrap()).unwrap_err();
        assert!(matches!(err, PkiError::Decode(_)));
    }

    #[test]
    fn test_from_der_invalid_data() {
        assert!(RevocationList::from_der(b"not-a-valid-der").is_err());
    }
}
