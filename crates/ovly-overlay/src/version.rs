//! Gentoo-style package versions
//!
//! `1.2.3b_rc2_p1-r4`: numeric components, an optional letter, any number of
//! suffixes and an optional revision. Ordering follows the package manager:
//! `_alpha < _beta < _pre < _rc < (none) < _p`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::OverlayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Suffix {
    Alpha,
    Beta,
    Pre,
    Rc,
    None,
    P,
}

impl Suffix {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "alpha" => Some(Suffix::Alpha),
            "beta" => Some(Suffix::Beta),
            "pre" => Some(Suffix::Pre),
            "rc" => Some(Suffix::Rc),
            "p" => Some(Suffix::P),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<String>,
    letter: Option<char>,
    suffixes: Vec<(Suffix, u64)>,
    revision: u32,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, OverlayError> {
        let invalid = || OverlayError::InvalidVersion(s.to_string());

        let (base, revision) = match s.rsplit_once("-r") {
            Some((base, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
                (base, rev.parse::<u32>().map_err(|_| invalid())?)
            }
            _ => (s, 0),
        };

        let mut parts = base.split('_');
        let numeric = parts.next().ok_or_else(invalid)?;
        let (numeric, letter) = match numeric.chars().last() {
            Some(c) if c.is_ascii_lowercase() => (&numeric[..numeric.len() - 1], Some(c)),
            _ => (numeric, None),
        };

        let components: Vec<String> = numeric.split('.').map(str::to_string).collect();
        if components
            .iter()
            .any(|c| c.is_empty() || !c.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        let mut suffixes = Vec::new();
        for part in parts {
            let split = part
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(part.len());
            let (name, num) = part.split_at(split);
            let suffix = Suffix::parse(name).ok_or_else(invalid)?;
            let num = if num.is_empty() {
                0
            } else {
                num.parse::<u64>().map_err(|_| invalid())?
            };
            suffixes.push((suffix, num));
        }

        Ok(Self {
            raw: s.to_string(),
            components,
            letter,
            suffixes,
            revision,
        })
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Version string without the revision
    pub fn base(&self) -> &str {
        match self.raw.rsplit_once("-r") {
            Some((base, _)) if self.revision > 0 || self.raw.ends_with("-r0") => base,
            _ => &self.raw,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// First component compares numerically; later ones with a leading zero
/// compare as decimal fractions.
fn cmp_component(idx: usize, a: &str, b: &str) -> Ordering {
    if idx > 0 && (a.starts_with('0') || b.starts_with('0')) {
        let a = a.trim_end_matches('0');
        let b = b.trim_end_matches('0');
        return a.cmp(b);
    }
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (idx, (a, b)) in self.components.iter().zip(&other.components).enumerate() {
            match cmp_component(idx, a, b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.components
            .len()
            .cmp(&other.components.len())
            .then_with(|| self.letter.cmp(&other.letter))
            .then_with(|| {
                let len = self.suffixes.len().max(other.suffixes.len());
                let none = (Suffix::None, 0);
                (0..len)
                    .map(|i| {
                        let a = self.suffixes.get(i).unwrap_or(&none);
                        let b = other.suffixes.get(i).unwrap_or(&none);
                        a.cmp(b)
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}
