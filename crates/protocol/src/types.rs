use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::ProtocolError;

/// Direction of a transfer, seen from the machine share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    /// Machine share to object storage.
    ToCloud,
    /// Object storage to machine share.
    FromCloud,
    /// A value this agent does not understand. Rejected by validation.
    Unknown(String),
}

impl Default for TransferDirection {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToCloud => f.write_str("ToCloud"),
            Self::FromCloud => f.write_str("FromCloud"),
            Self::Unknown(raw) => write!(f, "Unknown({raw})"),
        }
    }
}

impl Serialize for TransferDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::ToCloud => serializer.serialize_str("ToCloud"),
            Self::FromCloud => serializer.serialize_str("FromCloud"),
            Self::Unknown(raw) => serializer.serialize_str(raw),
        }
    }
}

/// Accepts the variant names (any case) or the numeric codes `0`/`1`.
/// Anything else becomes [`TransferDirection::Unknown`] so the request
/// still parses and fails validation instead.
impl<'de> Deserialize<'de> for TransferDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde_json::Value;

        let raw = Value::deserialize(deserializer)?;
        Ok(match raw {
            Value::String(s) if s.eq_ignore_ascii_case("ToCloud") => Self::ToCloud,
            Value::String(s) if s.eq_ignore_ascii_case("FromCloud") => Self::FromCloud,
            Value::String(s) => Self::Unknown(s),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Self::ToCloud,
                Some(1) => Self::FromCloud,
                _ => Self::Unknown(n.to_string()),
            },
            Value::Null => Self::default(),
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// A remote object to fetch into the machine share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteFile {
    /// File name to create under the machine share.
    pub name: String,
    /// Signed URI of the source object.
    pub url: String,
}

/// Credentials used to open the machine share.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl Credentials {
    /// User name as the OS expects it: `domain\user` when a domain is set.
    pub fn qualified_username(&self) -> String {
        match self.domain.as_deref() {
            Some(domain) if !domain.is_empty() => format!("{domain}\\{}", self.username),
            _ => self.username.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// A transfer request as delivered in a queue message body.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferRequest {
    pub transfer_id: Uuid,
    #[serde(default)]
    pub direction: TransferDirection,
    /// Local or UNC path the files are moved to or from.
    #[serde(default, deserialize_with = "null_as_default")]
    pub machine_share: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Machine operation the uploaded programs are attached to.
    #[serde(default, deserialize_with = "null_as_default")]
    pub cnc_machine_operation_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files_to_download: Vec<RemoteFile>,
    #[serde(default)]
    pub delete_local_files: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl TransferRequest {
    /// Decodes a queue message body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns `true` when both a user name and a password were supplied.
    pub fn should_authenticate(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.username) && present(&self.password)
    }

    /// Share credentials, if this request needs authentication.
    pub fn credentials(&self) -> Option<Credentials> {
        if !self.should_authenticate() {
            return None;
        }
        Some(Credentials {
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            domain: self.domain.clone().filter(|d| !d.is_empty()),
        })
    }

    /// Names of the files listed for download.
    pub fn download_names(&self) -> Vec<String> {
        self.files_to_download
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("transfer_id", &self.transfer_id)
            .field("direction", &self.direction)
            .field("machine_share", &self.machine_share)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .field("cnc_machine_operation_id", &self.cnc_machine_operation_id)
            .field("files_to_download", &self.files_to_download)
            .field("delete_local_files", &self.delete_local_files)
            .finish()
    }
}
