use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{PkiError, Result};

/// Common name carried by every authority pair.
pub const AUTHORITY_CN: &str = "ca";

const DAYS_PER_YEAR: u32 = 365;

/// Distinguished name fields copied into every certificate. The common name is
/// always supplied per certificate and never taken from the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectTemplate {
    pub country: String,
    pub state_province: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
}

impl SubjectTemplate {
    /// Builds the subject name for `common_name`, skipping blank template fields.
    pub fn build_name(&self, common_name: &str) -> std::result::Result<X509Name, ErrorStack> {
        let mut name_builder = X509NameBuilder::new()?;
        if !self.country.trim().is_empty() {
            name_builder.append_entry_by_nid(Nid::COUNTRYNAME, &self.country)?;
        }
        if !self.state_province.trim().is_empty() {
            name_builder.append_entry_by_nid(Nid::STATEORPROVINCENAME, &self.state_province)?;
        }
        if !self.locality.trim().is_empty() {
            name_builder.append_entry_by_nid(Nid::LOCALITYNAME, &self.locality)?;
        }
        if !self.organization.trim().is_empty() {
            name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        }
        if !self.organizational_unit.trim().is_empty() {
            name_builder
                .append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit)?;
        }
        name_builder.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        Ok(name_builder.build())
    }
}

/// How group tags are written into leaf certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupEncoding {
    /// Private extension holding a SEQUENCE OF UTF8String, never marked critical.
    #[default]
    Dedicated,
    /// Excluded DNS subtrees of a name-constraints extension. Only for
    /// deployments whose verifiers still read groups from there.
    NameConstraints,
}

/// Policy knobs for the authority manager and certificate issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    pub subject: SubjectTemplate,
    pub authority_lifetime_days: u32,
    pub leaf_lifetime_days: u32,
    pub crl_lifetime_days: u32,
    /// NotBefore is moved this far into the past to absorb clock skew.
    pub backdate_minutes: u32,
    pub authority_key_bits: u32,
    pub leaf_key_bits: u32,
    /// IP addresses added to the SAN of every leaf certificate.
    pub san_ips: Vec<IpAddr>,
    pub group_encoding: GroupEncoding,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            subject: SubjectTemplate::default(),
            authority_lifetime_days: 10 * DAYS_PER_YEAR,
            leaf_lifetime_days: 99 * DAYS_PER_YEAR,
            crl_lifetime_days: 99 * DAYS_PER_YEAR,
            backdate_minutes: 10,
            authority_key_bits: 2048,
            leaf_key_bits: 2048,
            san_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            group_encoding: GroupEncoding::Dedicated,
        }
    }
}

impl PkiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PkiError::decode("configuration", e))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PkiError::decode(&format!("configuration {}", path.as_ref().display()), e)
        })?;
        Self::from_json_str(&data)
    }

    pub fn subject(mut self, subject: SubjectTemplate) -> Self {
        self.subject = subject;
        self
    }
    pub fn authority_lifetime_days(mut self, days: u32) -> Self {
        self.authority_lifetime_days = days;
        self
    }
    pub fn leaf_lifetime_days(mut self, days: u32) -> Self {
        self.leaf_lifetime_days = days;
        self
    }
    pub fn crl_lifetime_days(mut self, days: u32) -> Self {
        self.crl_lifetime_days = days;
        self
    }
    pub fn backdate_minutes(mut self, minutes: u32) -> Self {
        self.backdate_minutes = minutes;
        self
    }
    /// Sets the RSA modulus size for both authority and leaf keys
    pub fn key_bits(mut self, bits: u32) -> Self {
        self.authority_key_bits = bits;
        self.leaf_key_bits = bits;
        self
    }
    /// Replaces the SAN IP list; pass an empty vector to issue DNS-only SANs
    pub fn san_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.san_ips = ips;
        self
    }
    pub fn group_encoding(mut self, encoding: GroupEncoding) -> Self {
        self.group_encoding = encoding;
        self
    }
}
