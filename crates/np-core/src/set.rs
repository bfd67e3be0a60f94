use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every set created by this system carries this prefix, so startup can
/// enumerate its own sets without touching anyone else's.
pub const SET_NAME_PREFIX: &str = "netpol-";

/// Holds the IPs of the pods scheduled on this node.
pub const LOCAL_PODS_SET: &str = "netpol-local-pods";

/// ipset rejects longer names.
pub const MAX_SET_NAME_LEN: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SetName(String);

impl SetName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.starts_with(SET_NAME_PREFIX) {
            return Err(Error::InvalidSetName {
                name,
                reason: "missing reserved prefix",
            });
        }
        if name.len() > MAX_SET_NAME_LEN {
            return Err(Error::InvalidSetName {
                name,
                reason: "longer than 31 bytes",
            });
        }
        Ok(Self(name))
    }

    pub fn local_pods() -> Self {
        Self(LOCAL_PODS_SET.to_string())
    }

    pub fn is_local_pods(&self) -> bool {
        self.0 == LOCAL_PODS_SET
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SetName {
    type Error = Error;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<SetName> for String {
    fn from(name: SetName) -> Self {
        name.0
    }
}

/// Element type of a named set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetType {
    /// Single IP addresses.
    HashIp,
    /// A list of other sets.
    ListSet,
}

impl SetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetType::HashIp => "hash:ip",
            SetType::ListSet => "list:set",
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_and_oversized_names() {
        assert!(SetName::new("weave-k?Z;25^M}|1s7P3|H9i;*;MhG").is_err());
        assert!(SetName::new("netpol-0123456789012345678901234").is_err());
        assert!(SetName::new("netpol-ns-default").is_ok());
    }

    #[test]
    fn local_pods_name_is_owned() {
        let local = SetName::local_pods();
        assert!(local.is_local_pods());
        assert_eq!(SetName::new(LOCAL_PODS_SET).unwrap(), local);
    }
}
