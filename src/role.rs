use std::str::FromStr;

use derive_more::{Display, Error};

/// Access level of a PowerDNS-Admin user or API key.
///
/// Parsing ignores case; `Display` always yields the capitalization the
/// server uses, so every resource stores the same spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Role {
    Administrator,
    Operator,
    User,
}

/// Whether a role allows an API key to be scoped to domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainScope {
    /// At least one domain must be associated.
    Required,
    /// Domains are ignored and any existing association is cleared.
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("unknown role '{_0}', expected one of 'Administrator', 'Operator' or 'User'")]
pub struct UnknownRole(#[error(not(source))] pub String);

impl Role {
    pub const ALL: [Self; 3] = [Self::Administrator, Self::Operator, Self::User];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Administrator => "Administrator",
            Self::Operator => "Operator",
            Self::User => "User",
        }
    }

    pub fn domain_scope(self) -> DomainScope {
        match self {
            Self::User => DomainScope::Required,
            Self::Administrator | Self::Operator => DomainScope::Forbidden,
        }
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}
