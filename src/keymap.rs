//! Keysym remapping for incoming key events.
//!
//! Some deployments need to rewrite particular keysyms before they reach
//! the desktop (dead keys, mismatched layouts). The mapping is configured
//! as a comma-separated list of `0xA->0xB` pairs.

use std::collections::HashMap;

/// A keysym substitution table.
#[derive(Debug, Default)]
pub struct KeyRemapper {
    mapping: HashMap<u32, u32>,
}

impl KeyRemapper {
    /// Parses a mapping specification such as `"0xff08->0xff09,0x61->0x62"`.
    ///
    /// Malformed pairs are skipped with a warning rather than rejected,
    /// so one typo does not disable the rest of the table. An empty
    /// specification yields an identity remapper.
    #[must_use]
    pub fn from_spec(spec: &str) -> Self {
        let mut mapping = HashMap::new();
        for pair in spec.split(',').filter(|s| !s.trim().is_empty()) {
            match Self::parse_pair(pair) {
                Some((from, to)) => {
                    mapping.insert(from, to);
                }
                None => log::warn!("Ignoring bad key remap entry: {pair:?}"),
            }
        }
        Self { mapping }
    }

    fn parse_pair(pair: &str) -> Option<(u32, u32)> {
        let (from, to) = pair.trim().split_once("->")?;
        Some((Self::parse_keysym(from)?, Self::parse_keysym(to)?))
    }

    fn parse_keysym(s: &str) -> Option<u32> {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        }
    }

    /// True if no substitutions are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Returns the keysym to deliver in place of `keysym`.
    #[must_use]
    pub fn remap(&self, keysym: u32) -> u32 {
        self.mapping.get(&keysym).copied().unwrap_or(keysym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_spec_is_identity() {
        let remapper = KeyRemapper::from_spec("");
        assert!(remapper.is_empty());
        assert_eq!(remapper.remap(0x61), 0x61);
    }

    #[test]
    fn test_single_pair() {
        let remapper = KeyRemapper::from_spec("0xff08->0xff09");
        assert_eq!(remapper.remap(0xff08), 0xff09);
        assert_eq!(remapper.remap(0xff0a), 0xff0a);
    }

    #[test]
    fn test_multiple_pairs_and_decimal() {
        let remapper = KeyRemapper::from_spec("0x61->0x62, 99->100");
        assert_eq!(remapper.remap(0x61), 0x62);
        assert_eq!(remapper.remap(99), 100);
    }

    #[test]
    fn test_bad_entry_is_skipped() {
        let remapper = KeyRemapper::from_spec("garbage,0x61->0x62");
        assert_eq!(remapper.remap(0x61), 0x62);
        assert_eq!(remapper.mapping.len(), 1);
    }
}
