use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Extension};
use tracing::info;
use x509_parser::extensions::{GeneralName, ParsedExtension, X509Extension as ParsedX509Extension};
use x509_parser::parse_x509_certificate;
use yasna::Tag;

use crate::authority::{AuthoritySelector, generate_key, validity_window};
use crate::config::{AUTHORITY_CN, GroupEncoding, PkiConfig};
use crate::error::{PkiError, Result};
use crate::pair::{KeyCertPair, serial_to_asn1};
use crate::store::{KeyStorage, SerialAllocator};

/// Netscape certificate type, used as the client/server role marker.
pub const ROLE_MARKER_OID: &str = "2.16.840.1.113730.1.1";
/// Private extension carrying group tags as a SEQUENCE OF UTF8String. Not a
/// standard X.509 semantic; verifiers that do not know it ignore it.
pub const GROUPS_OID: &str = "1.3.6.1.4.1.59337.1.1";
const NAME_CONSTRAINTS_OID: &str = "2.5.29.30";

/// Which side of a TLS connection a leaf certificate is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const CLIENT_MARKER: u8 = 0x80;
    pub const SERVER_MARKER: u8 = 0x40;

    pub fn from_server_flag(is_server: bool) -> Self {
        if is_server { Role::Server } else { Role::Client }
    }

    /// Discriminator byte stored in the role marker extension.
    pub fn marker(self) -> u8 {
        match self {
            Role::Client => Self::CLIENT_MARKER,
            Role::Server => Self::SERVER_MARKER,
        }
    }

    fn key_usage(self) -> std::result::Result<X509Extension, ErrorStack> {
        let mut usage = KeyUsage::new();
        usage.critical().digital_signature().key_agreement();
        if self == Role::Server {
            usage.key_encipherment();
        }
        usage.build()
    }

    fn extended_key_usage(self) -> std::result::Result<X509Extension, ErrorStack> {
        let mut usage = ExtendedKeyUsage::new();
        match self {
            Role::Client => usage.client_auth(),
            Role::Server => usage.server_auth(),
        };
        usage.build()
    }

    fn marker_der(self) -> Vec<u8> {
        yasna::construct_der(|writer| writer.write_bitvec_bytes(&[self.marker()], 2))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Issues client and server leaf certificates signed by the current authority.
pub struct CertificateIssuer {
    storage: Arc<dyn KeyStorage>,
    serials: Arc<dyn SerialAllocator>,
    selector: Arc<dyn AuthoritySelector>,
    config: Arc<PkiConfig>,
}

impl CertificateIssuer {
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

    /// Issues and stores a new leaf pair for `common_name`.
    ///
    /// The signing authority is read once at the start; an authority created
    /// while this call runs is only used by later calls. The authority common
    /// name is rejected with `ReservedCommonName`.
    pub fn issue_certificate(
        &self,
        common_name: &str,
        is_server: bool,
        groups: &[&str],
    ) -> Result<KeyCertPair> {
        if common_name == AUTHORITY_CN {
            return Err(PkiError::ReservedCommonName(common_name.to_string()));
        }
        let role = Role::from_server_flag(is_server);
        let authority = self
            .selector
            .signing_authority()
            .map_err(|e| e.authority_missing("fetching CA"))?;
        let (ca_key, ca_cert) = authority
            .decode()
            .map_err(|e| PkiError::corrupt_authority("parsing CA pair", e))?;
        let group_extension = self.group_extension(groups)?;
        let (not_before, not_after) = validity_window(
            Utc::now(),
            self.config.backdate_minutes,
            self.config.leaf_lifetime_days,
        )?;

        let pkey = generate_key(self.config.leaf_key_bits)
            .map_err(|e| PkiError::generation("creating private key", e))?;
        let serial = self
            .serials
            .next()
            .map_err(|e| PkiError::allocation("allocating certificate serial", e))?;

        let leaf = LeafTemplate {
            common_name,
            role,
            serial: &serial,
            group_extension: group_extension.as_ref(),
            not_before: &not_before,
            not_after: &not_after,
        };
        let cert = self
            .build_leaf(&leaf, &pkey, &ca_cert, &ca_key)
            .map_err(|e| PkiError::generation("creating certificate", e))?;
        let pair = KeyCertPair::encode(&pkey, &cert, common_name, serial)
            .map_err(|e| PkiError::generation("encoding certificate pair", e))?;
        self.storage
            .put(&pair)
            .map_err(|e| PkiError::storage("storing certificate pair", e))?;

        info!(
            common_name,
            serial = %pair.serial(),
            role = %role,
            authority = %authority.serial(),
            groups = groups.len(),
            "issued certificate"
        );
        Ok(pair)
    }

    /// OID and DER value of the group extension, `None` when there are no groups.
    fn group_extension(&self, groups: &[&str]) -> Result<Option<(&'static str, Vec<u8>)>> {
        if groups.is_empty() {
            return Ok(None);
        }
        match self.config.group_encoding {
            GroupEncoding::Dedicated => Ok(Some((GROUPS_OID, encode_groups(groups)))),
            GroupEncoding::NameConstraints => {
                if let Some(bad) = groups.iter().find(|g| !g.is_ascii()) {
                    return Err(PkiError::InvalidGroup(bad.to_string()));
                }
                Ok(Some((NAME_CONSTRAINTS_OID, encode_excluded_dns(groups))))
            }
        }
    }

    fn build_leaf(
        &self,
        leaf: &LeafTemplate<'_>,
        pkey: &PKey<Private>,
        ca_cert: &X509,
        ca_key: &PKey<Private>,
    ) -> std::result::Result<X509, ErrorStack> {
        let name = self.config.subject.build_name(leaf.common_name)?;
        let serial = serial_to_asn1(leaf.serial)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(ca_cert.subject_name())?;
        builder.set_pubkey(pkey)?;
        builder.set_not_before(leaf.not_before)?;
        builder.set_not_after(leaf.not_after)?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(leaf.role.key_usage()?)?;
        builder.append_extension(leaf.role.extended_key_usage()?)?;

        let mut san = SubjectAlternativeName::new();
        san.dns(leaf.common_name);
        for ip in &self.config.san_ips {
            san.ip(&ip.to_string());
        }
        let san = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(san)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(aki)?;

        builder.append_extension(raw_extension(ROLE_MARKER_OID, &leaf.role.marker_der())?)?;
        if let Some((oid, value)) = leaf.group_extension {
            builder.append_extension(raw_extension(oid, value)?)?;
        }

        builder.sign(ca_key, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

struct LeafTemplate<'a> {
    common_name: &'a str,
    role: Role,
    serial: &'a num_bigint::BigUint,
    group_extension: Option<&'a (&'static str, Vec<u8>)>,
    not_before: &'a Asn1Time,
    not_after: &'a Asn1Time,
}

fn raw_extension(oid: &str, value: &[u8]) -> std::result::Result<X509Extension, ErrorStack> {
    let oid = Asn1Object::from_str(oid)?;
    let contents = Asn1OctetString::new_from_bytes(value)?;
    X509Extension::new_from_der(&oid, false, &contents)
}

fn encode_groups(groups: &[&str]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence_of(|writer| {
            for group in groups {
                writer.next().write_utf8_string(group);
            }
        });
    })
}

fn decode_groups(value: &[u8]) -> Result<Vec<String>> {
    yasna::parse_der(value, |reader| {
        let mut groups = Vec::new();
        reader.read_sequence_of(|reader| {
            groups.push(reader.read_utf8string()?);
            Ok(())
        })?;
        Ok(groups)
    })
    .map_err(|e| PkiError::decode("group extension", e))
}

/// NameConstraints with only excludedSubtrees, one dNSName subtree per group.
fn encode_excluded_dns(groups: &[&str]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_tagged_implicit(Tag::context(1), |writer| {
                writer.write_sequence_of(|writer| {
                    for group in groups {
                        writer.next().write_sequence(|writer| {
                            writer
                                .next()
                                .write_tagged_implicit(Tag::context(2), |writer| {
                                    writer.write_ia5_string(group)
                                });
                        });
                    }
                });
            });
        });
    })
}

fn with_extensions<T>(
    cert: &X509,
    read: impl FnOnce(&[ParsedX509Extension<'_>]) -> Result<T>,
) -> Result<T> {
    let der = cert
        .to_der()
        .map_err(|e| PkiError::decode("certificate", e))?;
    let (_, parsed) =
        parse_x509_certificate(&der).map_err(|e| PkiError::decode("certificate", e))?;
    read(parsed.tbs_certificate.extensions())
}

/// Reads the group tags out of a leaf certificate.
///
/// The dedicated group extension wins; certificates issued with
/// [`GroupEncoding::NameConstraints`] are read from their excluded DNS subtrees.
pub fn extract_groups(cert: &X509) -> Result<Vec<String>> {
    let groups = with_extensions(cert, |extensions| {
        if let Some(ext) = extensions
            .iter()
            .find(|ext| ext.oid.to_id_string() == GROUPS_OID)
        {
            return decode_groups(ext.value);
        }
        let mut excluded = Vec::new();
        for ext in extensions {
            if let ParsedExtension::NameConstraints(constraints) = ext.parsed_extension() {
                for subtree in constraints.excluded_subtrees.iter().flatten() {
                    if let GeneralName::DNSName(name) = &subtree.base {
                        excluded.push(name.to_string());
                    }
                }
            }
        }
        Ok(excluded)
    })?;
    if groups.is_empty() {
        return Err(PkiError::NoGroups);
    }
    Ok(groups)
}

/// Reads the client/server role marker of a leaf certificate.
pub fn extract_role(cert: &X509) -> Result<Role> {
    with_extensions(cert, |extensions| {
        let ext = extensions
            .iter()
            .find(|ext| ext.oid.to_id_string() == ROLE_MARKER_OID)
            .ok_or(PkiError::NotFound("reading role marker"))?;
        let (bits, _) = yasna::parse_der(ext.value, |reader| reader.read_bitvec_bytes())
            .map_err(|e| PkiError::decode("role marker", e))?;
        match bits.first() {
            Some(&Role::CLIENT_MARKER) => Ok(Role::Client),
            Some(&Role::SERVER_MARKER) => Ok(Role::Server),
            other => Err(PkiError::Decode(format!("unknown role marker {other:?}"))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityManager, StoredAuthorities};
    use crate::store::{MemoryKeyStorage, MemorySerialAllocator};
    use std::net::{IpAddr, Ipv4Addr};

    struct Fixture {
        authorities: AuthorityManager,
        issuer: CertificateIssuer,
    }

    fn fixture(config: PkiConfig) -> Fixture {
        let storage = Arc::new(MemoryKeyStorage::new());
        let serials = Arc::new(MemorySerialAllocator::new());
        let selector = Arc::new(StoredAuthorities::new(storage.clone()));
        let config = Arc::new(config);
        Fixture {
            authorities: AuthorityManager::new(
                storage.clone(),
                serials.clone(),
                selector.clone(),
                config.clone(),
            ),
            issuer: CertificateIssuer::new(storage, serials, selector, config),
        }
    }

    fn text(cert: &X509) -> String {
        String::from_utf8_lossy(&cert.to_text().unwrap()).to_string()
    }

    #[test]
    fn client_certificate_policy() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(PkiConfig::default());
        let ca = f.authorities.create_authority()?.certificate()?;
        let cert = f.issuer.issue_certificate("svc-b", false, &[])?.certificate()?;

        let ca_key = ca.public_key()?;
        assert!(cert.verify(&ca_key)?);
        assert_eq!(extract_role(&cert)?, Role::Client);
        let text = text(&cert);
        assert!(text.contains("TLS Web Client Authentication"));
        assert!(!text.contains("TLS Web Server Authentication"));
        assert!(text.contains("Key Agreement"));
        assert!(!text.contains("Key Encipherment"));
        assert!(text.contains("DNS:svc-b"));
        assert!(text.contains("IP Address:127.0.0.1"));
        Ok(())
    }

    #[test]
    fn server_certificate_policy() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(PkiConfig::default());
        f.authorities.create_authority()?;
        let cert = f.issuer.issue_certificate("svc-a", true, &["web"])?.certificate()?;

        assert_eq!(extract_role(&cert)?, Role::Server);
        let text = text(&cert);
        assert!(text.contains("TLS Web Server Authentication"));
        assert!(text.contains("Key Encipherment"));
        assert!(text.contains("Key Agreement"));
        assert!(text.contains("CA:FALSE"));
        Ok(())
    }

    #[test]
    fn role_marker_der_matches_netscape_cert_type() {
        assert_eq!(Role::Client.marker_der(), vec![0x03, 0x02, 0x06, 0x80]);
        assert_eq!(Role::Server.marker_der(), vec![0x03, 0x02, 0x06, 0x40]);
    }

    #[test]
    fn groups_round_trip_in_dedicated_extension() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let f = fixture(PkiConfig::default());
        f.authorities.create_authority()?;
        let cert = f.issuer.issue_certificate("svc", false, &["ops", "db"])?.certificate()?;
        assert_eq!(extract_groups(&cert)?, vec!["ops".to_string(), "db".to_string()]);
        assert!(!text(&cert).contains("Name Constraints"));
        Ok(())
    }

    #[test]
    fn groups_round_trip_in_name_constraints() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let f = fixture(PkiConfig::default().group_encoding(GroupEncoding::NameConstraints));
        f.authorities.create_authority()?;
        let cert = f.issuer.issue_certificate("svc", true, &["ops", "db"])?.certificate()?;
        assert_eq!(extract_groups(&cert)?, vec!["ops".to_string(), "db".to_string()]);
        assert!(text(&cert).contains("Name Constraints"));
        Ok(())
    }

    #[test]
    fn name_constraints_reject_non_ascii_groups() {
        let f = fixture(PkiConfig::default().group_encoding(GroupEncoding::NameConstraints));
        f.authorities.create_authority().unwrap();
        let err = f
            .issuer
            .issue_certificate("svc", true, &["grüppe"])
            .unwrap_err();
        assert!(matches!(err, PkiError::InvalidGroup(_)));
    }

    #[test]
    fn no_groups_is_reported() {
        let f = fixture(PkiConfig::default());
        f.authorities.create_authority().unwrap();
        let cert = f
            .issuer
            .issue_certificate("svc", false, &[])
            .unwrap()
            .certificate()
            .unwrap();
        assert!(matches!(extract_groups(&cert), Err(PkiError::NoGroups)));
    }

    #[test]
    fn issuing_without_authority_is_unavailable() {
        let f = fixture(PkiConfig::default());
        let err = f.issuer.issue_certificate("svc", false, &[]).unwrap_err();
        assert!(matches!(err, PkiError::AuthorityUnavailable(_)));
    }

    #[test]
    fn san_ips_follow_configuration() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(
            PkiConfig::default().san_ips(vec![IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))]),
        );
        f.authorities.create_authority()?;
        let cert = f.issuer.issue_certificate("svc", true, &[])?.certificate()?;
        let text = text(&cert);
        assert!(text.contains("IP Address:10.1.2.3"));
        assert!(!text.contains("127.0.0.1"));
        Ok(())
    }

    #[test]
    fn leaf_is_issued_by_authority_subject() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(PkiConfig::default());
        let ca = f.authorities.create_authority()?.certificate()?;
        let cert = f.issuer.issue_certificate("svc", true, &[])?.certificate()?;
        assert_eq!(cert.issuer_name().to_der()?, ca.subject_name().to_der()?);
        assert_eq!(
            cert.authority_key_id().map(|id| id.as_slice().to_vec()),
            ca.subject_key_id().map(|id| id.as_slice().to_vec())
        );
        Ok(())
    }

    #[test]
    fn authority_common_name_is_reserved() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(PkiConfig::default());
        let ca = f.authorities.create_authority()?;
        let err = f.issuer.issue_certificate(AUTHORITY_CN, false, &[]).unwrap_err();
        assert!(matches!(err, PkiError::ReservedCommonName(ref cn) if cn == "ca"));

        assert_eq!(f.authorities.current_signing_authority()?, ca);
        let leaf = f.issuer.issue_certificate("svc", true, &[])?.certificate()?;
        let ca_key = ca.certificate()?.public_key()?;
        assert!(leaf.verify(&ca_key)?);
        Ok(())
    }

    struct ExhaustedSerials;

    impl SerialAllocator for ExhaustedSerials {
        fn next(&self) -> std::result::Result<num_bigint::BigUint, crate::error::StoreError> {
            Err(crate::error::StoreError::Exhausted)
        }
    }

    #[test]
    fn exhausted_serials_fail_issuance_with_allocation_error() {
        let storage = Arc::new(MemoryKeyStorage::new());
        let selector = Arc::new(StoredAuthorities::new(storage.clone()));
        let config = Arc::new(PkiConfig::default());
        AuthorityManager::new(
            storage.clone(),
            Arc::new(MemorySerialAllocator::new()),
            selector.clone(),
            config.clone(),
        )
        .create_authority()
        .unwrap();
        let issuer = CertificateIssuer::new(storage.clone(), Arc::new(ExhaustedSerials), selector, config);

        let err = issuer.issue_certificate("svc", true, &[]).unwrap_err();
        assert!(matches!(
            err,
            PkiError::Allocation {
                context: "allocating certificate serial",
                source: crate::error::StoreError::Exhausted
            }
        ));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn out_of_range_leaf_lifetime_is_invalid_config() {
        let config = PkiConfig::from_json_str(r#"{"leaf_lifetime_days": 4000000000}"#).unwrap();
        let f = fixture(config);
        f.authorities.create_authority().unwrap();
        let err = f.issuer.issue_certificate("svc", true, &[]).unwrap_err();
        assert!(matches!(err, PkiError::InvalidConfig(_)));
    }
}
