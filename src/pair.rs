use std::fmt;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::Path;

use num_bigint::BigUint;
use openssl::asn1::Asn1Integer;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::X509;

use crate::error::{PkiError, Result};

pub const PEM_RSA_PRIVATE_KEY: &str = "RSA PRIVATE KEY";
pub const PEM_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_CRL: &str = "X509 CRL";

/// A private key and the certificate issued for it, both PEM encoded.
///
/// Pairs are immutable once created; revoking a certificate only adds its
/// serial to the CRL.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    key_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    common_name: String,
    serial: BigUint,
}

impl fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("common_name", &self.common_name)
            .field("serial", &self.serial)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl KeyCertPair {
    pub fn new(key_pem: Vec<u8>, cert_pem: Vec<u8>, common_name: &str, serial: BigUint) -> Self {
        Self {
            key_pem,
            cert_pem,
            common_name: common_name.into(),
            serial,
        }
    }

    /// Encodes `key` as PKCS#1 and `cert` as a certificate block.
    pub(crate) fn encode(
        key: &PKey<Private>,
        cert: &X509,
        common_name: &str,
        serial: BigUint,
    ) -> std::result::Result<Self, ErrorStack> {
        let key_pem = key.rsa()?.private_key_to_pem()?;
        let cert_pem = cert.to_pem()?;
        Ok(Self::new(key_pem, cert_pem, common_name, serial))
    }

    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn serial(&self) -> &BigUint {
        &self.serial
    }

    pub fn private_key(&self) -> Result<PKey<Private>> {
        let rsa = Rsa::private_key_from_pem(&self.key_pem)
            .map_err(|e| PkiError::decode("private key", e))?;
        PKey::from_rsa(rsa).map_err(|e| PkiError::decode("private key", e))
    }

    pub fn certificate(&self) -> Result<X509> {
        X509::from_pem(&self.cert_pem).map_err(|e| PkiError::decode("certificate", e))
    }

    /// Parses both halves of the pair.
    pub fn decode(&self) -> Result<(PKey<Private>, X509)> {
        Ok((self.private_key()?, self.certificate()?))
    }

    /// Writes `<path>/<filename>_pkey.pem` and `<path>/<filename>_cert.pem`,
    /// creating `path` if needed.
    pub fn save<P: AsRef<Path>>(&self, path: P, filename: &str) -> std::io::Result<()> {
        create_dir_all(&path)?;
        let write_file = |suffix: &str, content: &[u8]| -> std::io::Result<()> {
            let full_path = path.as_ref().join(format!("{filename}{suffix}"));
            let mut file = File::create(full_path)?;
            file.write_all(content)?;
            file.sync_all()
        };
        // certificate last, so a readable cert implies its key is on disk
        write_file("_pkey.pem", &self.key_pem)?;
        write_file("_cert.pem", &self.cert_pem)?;
        Ok(())
    }

    /// Reads a pair previously written by [`KeyCertPair::save`].
    pub fn load<C: AsRef<Path>, K: AsRef<Path>>(
        cert_pem_file: C,
        key_pem_file: K,
        common_name: &str,
        serial: BigUint,
    ) -> std::io::Result<Self> {
        let cert_pem = std::fs::read(cert_pem_file)?;
        let key_pem = std::fs::read(key_pem_file)?;
        Ok(Self::new(key_pem, cert_pem, common_name, serial))
    }
}

pub(crate) fn serial_to_asn1(serial: &BigUint) -> std::result::Result<Asn1Integer, ErrorStack> {
    BigNum::from_slice(&serial.to_bytes_be())?.to_asn1_integer()
}

/// Reads the serial of `cert` at full precision.
pub fn serial_of(cert: &X509) -> Result<BigUint> {
    let bytes = cert
        .serial_number()
        .to_bn()
        .map_err(|e| PkiError::decode("certificate serial", e))?
        .to_vec();
    Ok(BigUint::from_bytes_be(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;

    fn self_signed(serial: &BigUint) -> (PKey<Private>, X509) {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let name = crate::config::SubjectTemplate::default()
            .build_name("pair-test")
            .unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = serial_to_asn1(serial).unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        (pkey, builder.build())
    }

    #[test]
    fn encode_uses_pkcs1_and_certificate_labels() {
        let serial = BigUint::from(7u32);
        let (pkey, cert) = self_signed(&serial);
        let pair = KeyCertPair::encode(&pkey, &cert, "pair-test", serial).unwrap();
        let key_text = String::from_utf8_lossy(pair.key_pem());
        let cert_text = String::from_utf8_lossy(pair.cert_pem());
        assert!(key_text.starts_with(&format!("-----BEGIN {PEM_RSA_PRIVATE_KEY}-----")));
        assert!(cert_text.starts_with(&format!("-----BEGIN {PEM_CERTIFICATE}-----")));
    }

    #[test]
    fn decode_round_trips_key_material() {
        let serial = BigUint::from(8u32);
        let (pkey, cert) = self_signed(&serial);
        let pair = KeyCertPair::encode(&pkey, &cert, "pair-test", serial).unwrap();
        let (key, decoded) = pair.decode().unwrap();
        assert_eq!(
            key.public_key_to_der().unwrap(),
            decoded.public_key().unwrap().public_key_to_der().unwrap()
        );
    }

    #[test]
    fn garbage_pem_is_a_decode_error() {
        let pair = KeyCertPair::new(b"nope".to_vec(), b"nope".to_vec(), "x", BigUint::from(1u32));
        assert!(matches!(pair.private_key(), Err(PkiError::Decode(_))));
        assert!(matches!(pair.certificate(), Err(PkiError::Decode(_))));
    }

    #[test]
    fn serial_survives_beyond_machine_word() {
        let serial = BigUint::parse_bytes(b"1234567890123456789012345678901234567890", 10).unwrap();
        let (_, cert) = self_signed(&serial);
        assert_eq!(serial_of(&cert).unwrap(), serial);
    }

    #[test]
    fn debug_output_hides_private_key() {
        let pair = KeyCertPair::new(
            b"secret-key".to_vec(),
            b"cert".to_vec(),
            "svc",
            BigUint::from(3u32),
        );
        let text = format!("{pair:?}");
        assert!(!text.contains("secret-key"));
        assert!(text.contains("svc"));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KeyCertPair::new(b"key".to_vec(), b"cert".to_vec(), "svc", BigUint::from(9u32));
        pair.save(dir.path(), "9").unwrap();
        let loaded = KeyCertPair::load(
            dir.path().join("9_cert.pem"),
            dir.path().join("9_pkey.pem"),
            "svc",
            BigUint::from(9u32),
        )
        .unwrap();
        assert_eq!(loaded, pair);
    }
}
