//! CPU sets: ordered sets of logical processor indices
//!
//! Three textual forms are supported:
//! - mask: `0x0000000f` with comma-separated 32-bit words, highest first
//! - taskset: `0xf`, a single hexadecimal number without separators
//! - list: `0-3,8`, the format of sysfs `cpulist` files

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Highest CPU index accepted when parsing
pub const MAX_CPU_INDEX: u32 = 65535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuSetError {
    #[error("Invalid cpuset mask word: {0}")]
    InvalidMask(String),
    #[error("Invalid cpu list entry: {0}")]
    InvalidList(String),
    #[error("CPU index {0} exceeds the maximum of {max}", max = MAX_CPU_INDEX)]
    IndexTooLarge(u64),
}

fn check_index(cpu: u32) -> Result<u32, CpuSetError> {
    if cpu > MAX_CPU_INDEX {
        return Err(CpuSetError::IndexTooLarge(u64::from(cpu)));
    }
    Ok(cpu)
}

/// An ordered set of CPU indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Set containing every index in `first..=last`
    pub fn from_range(first: u32, last: u32) -> Self {
        Self((first..=last).collect())
    }

    pub fn insert(&mut self, cpu: u32) -> bool {
        self.0.insert(cpu)
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of CPUs in the set
    pub fn weight(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// True if every CPU of `self` is also in `other`
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// True if `self` contains every CPU of `other`
    pub fn is_superset(&self, other: &CpuSet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn intersects(&self, other: &CpuSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Parse a list such as `0-3,8,10-11`
    pub fn parse_list(s: &str) -> Result<Self, CpuSetError> {
        let mut set = CpuSet::new();
        for part in s.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start
                        .trim()
                        .parse()
                        .map_err(|_| CpuSetError::InvalidList(part.to_string()))?;
                    let end: u32 = end
                        .trim()
                        .parse()
                        .map_err(|_| CpuSetError::InvalidList(part.to_string()))?;
                    if end < start {
                        return Err(CpuSetError::InvalidList(part.to_string()));
                    }
                    set.0.extend(check_index(start)?..=check_index(end)?);
                }
                None => {
                    let cpu: u32 = part
                        .parse()
                        .map_err(|_| CpuSetError::InvalidList(part.to_string()))?;
                    set.0.insert(check_index(cpu)?);
                }
            }
        }
        Ok(set)
    }

    /// Parse a mask such as `0x00000001,0x000000ff` (or a single taskset word)
    pub fn parse_mask(s: &str) -> Result<Self, CpuSetError> {
        let words: Vec<&str> = s.trim().split(',').collect();
        let mut set = CpuSet::new();
        for (position, word) in words.iter().rev().enumerate() {
            let digits = word
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            if digits.is_empty() {
                return Err(CpuSetError::InvalidMask(word.to_string()));
            }
            // A taskset string is a single word that may exceed 32 bits
            let chunks = split_hex_words(digits);
            for (sub, chunk) in chunks.iter().rev().enumerate() {
                let value = u32::from_str_radix(chunk, 16)
                    .map_err(|_| CpuSetError::InvalidMask(word.to_string()))?;
                let base = ((position + sub) * 32) as u64;
                for bit in 0..32 {
                    if value & (1 << bit) != 0 {
                        let cpu = base + bit;
                        if cpu > u64::from(MAX_CPU_INDEX) {
                            return Err(CpuSetError::IndexTooLarge(cpu));
                        }
                        set.0.insert(cpu as u32);
                    }
                }
            }
            if chunks.len() > 1 && words.len() > 1 {
                return Err(CpuSetError::InvalidMask(word.to_string()));
            }
        }
        Ok(set)
    }

    /// Format as a cpu list (`0-3,8`)
    pub fn to_list_string(&self) -> String {
        let mut parts = Vec::new();
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }
        parts.join(",")
    }

    /// Format as a taskset-compatible mask (`0xf`)
    pub fn to_taskset_string(&self) -> String {
        let words = self.words();
        let mut out = String::from("0x");
        let mut leading = true;
        for word in words.iter().rev() {
            if leading {
                if *word == 0 && words.len() > 1 {
                    continue;
                }
                out.push_str(&format!("{:x}", word));
                leading = false;
            } else {
                out.push_str(&format!("{:08x}", word));
            }
        }
        if leading {
            out.push('0');
        }
        out
    }

    /// 32-bit words, lowest first, without trailing zero words
    fn words(&self) -> Vec<u32> {
        let Some(last) = self.last() else {
            return vec![0];
        };
        let mut words = vec![0u32; (last / 32 + 1) as usize];
        for cpu in self.iter() {
            words[(cpu / 32) as usize] |= 1 << (cpu % 32);
        }
        words
    }
}

fn split_hex_words(digits: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut end = digits.len();
    while end > 0 {
        let start = end.saturating_sub(8);
        chunks.push(&digits[start..end]);
        end = start;
    }
    chunks.reverse();
    chunks
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "0x0");
        }
        let words: Vec<String> = self
            .words()
            .iter()
            .rev()
            .map(|w| format!("0x{:08x}", w))
            .collect();
        write!(f, "{}", words.join(","))
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            Self::parse_mask(trimmed)
        } else {
            Self::parse_list(trimmed)
        }
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<u32> for CpuSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let set = CpuSet::parse_list("0-3,8,10-11\n").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(set.to_list_string(), "0-3,8,10-11");
    }

    #[test]
    fn test_parse_list_rejects_garbage() {
        assert!(CpuSet::parse_list("0-x").is_err());
        assert!(CpuSet::parse_list("5-2").is_err());
        assert!(CpuSet::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_indices_are_bounded() {
        assert_eq!(
            CpuSet::parse_list("0-4294967295"),
            Err(CpuSetError::IndexTooLarge(4294967295))
        );
        assert_eq!(
            CpuSet::parse_list("65536"),
            Err(CpuSetError::IndexTooLarge(65536))
        );
        assert_eq!(CpuSet::parse_list("65535").unwrap().last(), Some(MAX_CPU_INDEX));

        let mut huge = String::from("0x1");
        huge.push_str(&"0".repeat(20000));
        assert!(matches!(
            huge.parse::<CpuSet>(),
            Err(CpuSetError::IndexTooLarge(_))
        ));
    }

    #[test]
    fn test_mask_format() {
        assert_eq!(CpuSet::from_range(0, 3).to_string(), "0x0000000f");
        assert_eq!(CpuSet::new().to_string(), "0x0");

        let high: CpuSet = [0, 32].into_iter().collect();
        assert_eq!(high.to_string(), "0x00000001,0x00000001");
        assert_eq!(high.to_taskset_string(), "0x100000001");
    }

    #[test]
    fn test_parse_mask() {
        let set: CpuSet = "0x00000001,0x000000f0".parse().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7, 32]);

        let taskset: CpuSet = "0x100000001".parse().unwrap();
        assert_eq!(taskset.iter().collect::<Vec<_>>(), vec![0, 32]);
        assert!("0xzz".parse::<CpuSet>().is_err());
    }

    #[test]
    fn test_set_relations() {
        let all = CpuSet::from_range(0, 7);
        let half = CpuSet::from_range(0, 3);
        let other = CpuSet::from_range(4, 7);

        assert!(half.is_subset(&all));
        assert!(all.is_superset(&half));
        assert!(!half.intersects(&other));
        assert_eq!(half.union(&other), all);
        assert_eq!(all.intersection(&other), other);
        assert_eq!(all.weight(), 8);
    }
}
