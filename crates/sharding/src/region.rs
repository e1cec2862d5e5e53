//! Region enumeration.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ShardingError;

/// Geographic placement hint for an actor instance.
///
/// The set is fixed; identifiers carry the lowercase key verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKey {
    /// Asia-Pacific.
    Apac,
    /// Western Europe.
    Weur,
    /// Eastern North America.
    Enam,
    /// Western North America.
    Wnam,
    /// Oceania.
    Oc,
    /// Africa.
    Afr,
    /// Middle East.
    Me,
}

impl RegionKey {
    /// Every region, in declaration order.
    pub const ALL: [RegionKey; 7] = [
        RegionKey::Apac,
        RegionKey::Weur,
        RegionKey::Enam,
        RegionKey::Wnam,
        RegionKey::Oc,
        RegionKey::Afr,
        RegionKey::Me,
    ];

    /// Returns the wire key, e.g. `"apac"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RegionKey::Apac => "apac",
            RegionKey::Weur => "weur",
            RegionKey::Enam => "enam",
            RegionKey::Wnam => "wnam",
            RegionKey::Oc => "oc",
            RegionKey::Afr => "afr",
            RegionKey::Me => "me",
        }
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionKey {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegionKey::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ShardingError::invalid(format!("unknown region key {s:?}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display_agree() {
        for region in RegionKey::ALL {
            assert_eq!(region.to_string().parse::<RegionKey>().unwrap(), region);
        }
    }

    #[test]
    fn test_serde_uses_wire_key() {
        assert_eq!(serde_json::to_string(&RegionKey::Wnam).unwrap(), "\"wnam\"");
        assert!("APAC".parse::<RegionKey>().is_err());
    }
}
