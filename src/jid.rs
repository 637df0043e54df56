//! Jabber identifiers (`local@domain/resource`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// An XMPP address. The local part and resource are optional; the domain is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // The resource may itself contain '@' and '/', so split it off first.
        let (addr, resource) = match trimmed.split_once('/') {
            Some((addr, res)) => (addr, Some(res)),
            None => (trimmed, None),
        };
        let (local, domain) = match addr.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, addr),
        };

        if domain.is_empty()
            || local.is_some_and(str::is_empty)
            || resource.is_some_and(str::is_empty)
        {
            return Err(Error::InvalidJid(s.to_string()));
        }

        Ok(Jid {
            local: local.map(str::to_string),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(str::to_string),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "juliet@Capulet.lit/balcony".parse().unwrap();
        assert_eq!(jid.local(), Some("juliet"));
        assert_eq!(jid.domain(), "capulet.lit");
        assert_eq!(jid.resource(), Some("balcony"));
        assert_eq!(jid.to_string(), "juliet@capulet.lit/balcony");
    }

    #[test]
    fn test_parse_domain_only() {
        let jid: Jid = "capulet.lit".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert!(jid.is_bare());
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid: Jid = "juliet@capulet.lit/a@b/c".parse().unwrap();
        assert_eq!(jid.resource(), Some("a@b/c"));
    }

    #[test]
    fn test_reject_empty_parts() {
        assert!("@capulet.lit".parse::<Jid>().is_err());
        assert!("juliet@".parse::<Jid>().is_err());
        assert!("juliet@capulet.lit/".parse::<Jid>().is_err());
    }

    #[test]
    fn test_bare_and_with_resource() {
        let jid: Jid = "juliet@capulet.lit/balcony".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "juliet@capulet.lit");
        assert_eq!(jid.to_bare().with_resource("orchard").resource(), Some("orchard"));
    }
}
