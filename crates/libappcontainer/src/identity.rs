//! Resolution of loosely specified identifying hints into one container
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::container::record::ContainerRecord;
use crate::container::store::{StateStore, StoreError};

static UUID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").expect("valid uuid pattern"));
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("valid name pattern"));

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no container matches {0}")]
    NotFound(String),
    #[error("{hints} matches more than one container: {candidates:?}")]
    Ambiguous {
        hints: String,
        candidates: Vec<String>,
    },
    #[error("container {container_uuid} has {field} {found:?}, but {expected:?} was requested")]
    ConflictingIdentity {
        container_uuid: String,
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("invalid {field}: {value:?}")]
    InvalidHint { field: &'static str, value: String },
    #[error("at least one of container uuid, container name, application uuid or application name is required")]
    NoIdentifyingHints,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runtime descriptor passed along with a request. Only used for auditing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CartridgeDescriptor {
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub component: Option<String>,
    pub software_version: Option<String>,
}

/// Whatever the caller knows about the container it wants to address.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityHints {
    pub application_uuid: Option<String>,
    pub application_name: Option<String>,
    pub container_uuid: Option<String>,
    pub container_name: Option<String>,
    pub namespace: Option<String>,
    // Correlation only, never used for resolution
    pub request_id: Option<String>,
    #[serde(default)]
    pub cartridge: CartridgeDescriptor,
}

impl IdentityHints {
    pub fn by_container_uuid(container_uuid: &str) -> Self {
        Self {
            container_uuid: Some(container_uuid.to_owned()),
            ..Default::default()
        }
    }

    pub fn by_name(container_name: &str, namespace: Option<&str>) -> Self {
        Self {
            container_name: Some(container_name.to_owned()),
            namespace: namespace.map(str::to_owned),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_owned());
        self
    }

    /// Drops empty strings so that `--with-namespace ""` means "not given".
    fn normalized(&self) -> Self {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        Self {
            application_uuid: clean(&self.application_uuid),
            application_name: clean(&self.application_name),
            container_uuid: clean(&self.container_uuid),
            container_name: clean(&self.container_name),
            namespace: clean(&self.namespace),
            request_id: clean(&self.request_id),
            cartridge: self.cartridge.clone(),
        }
    }

    fn validate(&self) -> Result<(), ResolveError> {
        let checks: [(&'static str, &Option<String>, &Regex); 5] = [
            ("container uuid", &self.container_uuid, &*UUID_PATTERN),
            ("application uuid", &self.application_uuid, &*UUID_PATTERN),
            ("container name", &self.container_name, &*NAME_PATTERN),
            ("application name", &self.application_name, &*NAME_PATTERN),
            ("namespace", &self.namespace, &*NAME_PATTERN),
        ];
        for (field, value, pattern) in checks {
            if let Some(value) = value {
                if !pattern.is_match(value) {
                    return Err(ResolveError::InvalidHint {
                        field,
                        value: value.to_owned(),
                    });
                }
            }
        }

        if self.container_uuid.is_none()
            && self.container_name.is_none()
            && self.application_uuid.is_none()
            && self.application_name.is_none()
        {
            return Err(ResolveError::NoIdentifyingHints);
        }
        Ok(())
    }

    /// Hint fields that have to agree with the record, in a fixed order.
    fn constraints(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("application uuid", self.application_uuid.as_deref()),
            ("application name", self.application_name.as_deref()),
            ("container name", self.container_name.as_deref()),
            ("namespace", self.namespace.as_deref()),
        ]
    }

    fn matches(&self, record: &ContainerRecord) -> bool {
        self.constraints()
            .iter()
            .all(|(field, wanted)| match wanted {
                Some(wanted) => record_field(record, field) == *wanted,
                None => true,
            })
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(uuid) = &self.container_uuid {
            parts.push(format!("container uuid {uuid}"));
        }
        for (field, value) in self.constraints() {
            if let Some(value) = value {
                parts.push(format!("{field} {value}"));
            }
        }
        parts.join(", ")
    }
}

fn record_field<'a>(record: &'a ContainerRecord, field: &str) -> &'a str {
    match field {
        "application uuid" => &record.application_uuid,
        "application name" => &record.application_name,
        "container name" => &record.container_name,
        "namespace" => &record.namespace,
        _ => "",
    }
}

/// Canonical identity of exactly one existing container
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerIdentity {
    pub application_uuid: String,
    pub container_uuid: String,
    pub application_name: String,
    pub container_name: String,
    pub namespace: String,
}

impl From<&ContainerRecord> for ContainerIdentity {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            application_uuid: record.application_uuid.to_owned(),
            container_uuid: record.container_uuid.to_owned(),
            application_name: record.application_name.to_owned(),
            container_name: record.container_name.to_owned(),
            namespace: record.namespace.to_owned(),
        }
    }
}

/// Resolves `hints` against the records in `store`.
///
/// A container uuid is authoritative: the record is looked up by key and every
/// other hint must agree with it. Without a uuid all given hints are matched
/// together and exactly one record may match.
pub fn resolve(store: &StateStore, hints: &IdentityHints) -> Result<ContainerIdentity, ResolveError> {
    let hints = hints.normalized();
    hints.validate()?;

    if let Some(container_uuid) = hints.container_uuid.as_deref() {
        let record = store
            .load(container_uuid)?
            .ok_or_else(|| ResolveError::NotFound(hints.describe()))?;
        for (field, wanted) in hints.constraints() {
            if let Some(wanted) = wanted {
                let found = record_field(&record, field);
                if found != wanted {
                    return Err(ResolveError::ConflictingIdentity {
                        container_uuid: container_uuid.to_owned(),
                        field,
                        expected: wanted.to_owned(),
                        found: found.to_owned(),
                    });
                }
            }
        }
        return Ok(ContainerIdentity::from(&record));
    }

    let mut matches: Vec<ContainerRecord> = store
        .list()?
        .into_iter()
        .filter(|record| hints.matches(record))
        .collect();
    match matches.len() {
        0 => Err(ResolveError::NotFound(hints.describe())),
        1 => Ok(ContainerIdentity::from(&matches.remove(0))),
        _ => {
            tracing::warn!(
                hints = %hints.describe(),
                count = matches.len(),
                "identity hints match several containers"
            );
            Err(ResolveError::Ambiguous {
                hints: hints.describe(),
                candidates: matches.into_iter().map(|r| r.container_uuid).collect(),
            })
        }
    }
}
