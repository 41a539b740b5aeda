//! Domain Resolver
//!
//! Matching works on whole directories. A directory matches when any of its
//! certificates carries a SAN entry that *contains* the requested domain (or
//! `*.` + domain) as a substring, and then every file of that directory is
//! returned, since private keys and chain files have no domain of their own.
//!
//! The substring test is loose: a query for `example.com` also matches
//! `notexample.com` and `sub.example.com`. Callers must keep one certificate
//! set per directory and avoid overlapping names.

use crate::store::{CertificateFile, DirectoryIndex};

impl DirectoryIndex {
    /// Whether any certificate in this directory names `domain`.
    pub fn matches(&self, domain: &str) -> bool {
        let wildcard = format!("*.{domain}");
        self.files.iter().any(|file| {
            file.domains
                .iter()
                .any(|name| name.contains(domain) || name.contains(&wildcard))
        })
    }
}

/// All files of every matching directory, directories in the given order and
/// files in scan order. Empty when nothing matches.
pub fn resolve<'a>(indices: &'a [DirectoryIndex], domain: &str) -> Vec<&'a CertificateFile> {
    indices
        .iter()
        .filter(|index| index.matches(domain))
        .flat_map(|index| index.files.iter())
        .collect()
}
