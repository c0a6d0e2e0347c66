//! Tablespace name filters
//!
//! Names are engine-relative paths without extension, e.g. `shop/orders`.

use regex::Regex;

/// Prefix the engine gives intermediate tables of in-place rebuilds
const TRANSIENT_PREFIX: &str = "#sql";

/// Include/exclude regex lists. An empty include list includes everything;
/// exclusion always wins.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            include: include.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            exclude: exclude.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
        })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_included(&self, name: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(name));
        included && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

/// Whether the last path component names a transient rebuild table
pub fn is_transient_name(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|last| last.starts_with(TRANSIENT_PREFIX))
}
