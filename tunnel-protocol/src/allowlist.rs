//! Port-range allow-list (spec §4.2 NEW_SERVICE validation, §6 `allow_ports`).
//!
//! Parsed once at config load time into a small vector of ranges, instead of
//! re-parsing the specification string on every check the way the original
//! `IsAllowPort` does.

use std::ops::RangeInclusive;

use crate::error::AllowListError;

/// A parsed `"a-b,c,d-e"` port allow-list.
#[derive(Debug, Clone)]
pub struct PortAllowList {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortAllowList {
    /// Parse a comma-separated list of ports and/or `min-max` ranges.
    pub fn parse(spec: &str) -> Result<Self, AllowListError> {
        let mut ranges = Vec::new();
        for field in spec.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            if let Some((min, max)) = field.split_once('-') {
                let min: u32 = min
                    .parse()
                    .map_err(|_| AllowListError::InvalidPort(min.to_string()))?;
                let max: u32 = max
                    .parse()
                    .map_err(|_| AllowListError::InvalidPort(max.to_string()))?;
                if min > max || max > 65535 {
                    return Err(AllowListError::OutOfBounds { min, max });
                }
                ranges.push((min as u16)..=(max as u16));
            } else {
                let port: u16 = field
                    .parse()
                    .map_err(|_| AllowListError::InvalidPort(field.to_string()))?;
                ranges.push(port..=port);
            }
        }
        if ranges.is_empty() {
            return Err(AllowListError::InvalidRange(spec.to_string()));
        }
        Ok(PortAllowList { ranges })
    }

    /// Matches the default from spec §6 (`1-65535`).
    pub fn allow_all() -> Self {
        PortAllowList {
            ranges: vec![1..=65535],
        }
    }

    pub fn allows(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_ports_and_ranges() {
        let list = PortAllowList::parse("22,80,6000-6100").unwrap();
        assert!(list.allows(22));
        assert!(list.allows(80));
        assert!(list.allows(6050));
        assert!(!list.allows(6101));
        assert!(!list.allows(8080));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(PortAllowList::parse("100-10").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(PortAllowList::parse("not-a-port").is_err());
        assert!(PortAllowList::parse("").is_err());
    }

    #[test]
    fn allow_all_covers_full_range() {
        let list = PortAllowList::allow_all();
        assert!(list.allows(1));
        assert!(list.allows(65535));
    }
}
