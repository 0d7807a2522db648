use openssl::error::ErrorStack;
use thiserror::Error;

/// Failure reported by one of the external collaborators: key storage,
/// serial allocator or CRL store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entry found")]
    NotFound,
    #[error("serial space exhausted")]
    Exhausted,
    /// Returned by `CrlStore::compare_and_put` when the stored CRL is not the one the
    /// caller read.
    #[error("stored value changed concurrently")]
    Conflict,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Errors surfaced by the authority manager, certificate issuer and revocation engine.
///
/// Variants wrapping a collaborator or openssl failure carry the step that failed
/// (e.g. "fetching CA", "signing CRL").
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("serial allocation failed while {context}: {source}")]
    Allocation {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("generation failed while {context}: {source}")]
    Generation {
        context: &'static str,
        #[source]
        source: ErrorStack,
    },
    #[error("storage failure while {context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("no authority pair available while {0}")]
    AuthorityUnavailable(&'static str),
    #[error("authority pair is corrupt while {context}: {source}")]
    AuthorityCorrupt {
        context: &'static str,
        #[source]
        source: Box<PkiError>,
    },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("certificate carries no group metadata")]
    NoGroups,
    #[error("group tag {0:?} can not be encoded")]
    InvalidGroup(String),
    /// The common name belongs to authority pairs and can not be used for a leaf.
    #[error("common name {0:?} is reserved for authorities")]
    ReservedCommonName(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PkiError>;

impl PkiError {
    pub(crate) fn allocation(context: &'static str, source: StoreError) -> Self {
        PkiError::Allocation { context, source }
    }

    pub(crate) fn generation(context: &'static str, source: ErrorStack) -> Self {
        PkiError::Generation { context, source }
    }

    /// Wraps a collaborator failure, keeping "nothing stored" distinguishable.
    pub(crate) fn storage(context: &'static str, source: StoreError) -> Self {
        match source {
            StoreError::NotFound => PkiError::NotFound(context),
            source => PkiError::Storage { context, source },
        }
    }

    pub(crate) fn corrupt_authority(context: &'static str, source: PkiError) -> Self {
        PkiError::AuthorityCorrupt {
            context,
            source: Box::new(source),
        }
    }

    /// A missing authority is `AuthorityUnavailable` for issuance and revocation.
    pub(crate) fn authority_missing(self, context: &'static str) -> Self {
        match self {
            PkiError::NotFound(_) => PkiError::AuthorityUnavailable(context),
            other => other,
        }
    }

    pub(crate) fn decode(what: &str, err: impl std::fmt::Display) -> Self {
        PkiError::Decode(format!("{what}: {err}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PkiError::NotFound(_))
    }
}
