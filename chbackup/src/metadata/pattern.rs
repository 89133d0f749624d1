//! `db.table` glob patterns used by `--tables` and `skip_tables`.

use crate::utils::{BackupError, Result};
use regex::Regex;

/// A comma-separated list of shell globs (`*`, `?`) matched against
/// `database.table`. An empty pattern matches every table.
#[derive(Debug, Clone)]
pub struct TablePattern {
    globs: Vec<Regex>,
}

impl TablePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut globs = Vec::new();
        for glob in pattern.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            globs.push(glob_to_regex(glob)?);
        }
        Ok(Self { globs })
    }

    pub fn from_list(patterns: &[String]) -> Result<Self> {
        Self::parse(&patterns.join(","))
    }

    /// Pattern that matches everything.
    pub fn all() -> Self {
        Self { globs: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn matches(&self, database: &str, table: &str) -> bool {
        if self.globs.is_empty() {
            return true;
        }
        let name = format!("{}.{}", database, table);
        self.globs.iter().any(|re| re.is_match(&name))
    }

    /// Like [`matches`](Self::matches) but an empty pattern matches nothing.
    pub fn matches_any(&self, database: &str, table: &str) -> bool {
        !self.globs.is_empty() && self.matches(database, table)
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| BackupError::Config(format!("invalid table pattern '{}': {}", glob, e)))
}
