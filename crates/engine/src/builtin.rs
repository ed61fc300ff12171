//! Snippets shipped with the runtime under the `built-in` reference.

use chrono::Utc;
use host::Snippet;
use host::backend::StoreError;

use crate::store::SqliteStore;

pub const BUILTIN_REFERENCE: &str = "built-in";

pub struct BuiltinSnippet {
    pub name: &'static str,
    pub method: &'static str,
    pub source: &'static str,
}

pub const BUILTIN_SNIPPETS: &[BuiltinSnippet] = &[
    BuiltinSnippet {
        name: "ip",
        method: "GET",
        source: include_str!("builtin/ip.ts"),
    },
    BuiltinSnippet {
        name: "geocode_location",
        method: "GET",
        source: include_str!("builtin/geocode_location.ts"),
    },
    BuiltinSnippet {
        name: "geocode_search",
        method: "GET",
        source: include_str!("builtin/geocode_search.ts"),
    },
];

/// Canonical source for a built-in snippet, if `reference/name` is one.
pub fn canonical_source(reference: &str, name: &str) -> Option<&'static str> {
    if reference != BUILTIN_REFERENCE {
        return None;
    }
    BUILTIN_SNIPPETS
        .iter()
        .find(|builtin| builtin.name == name)
        .map(|builtin| builtin.source)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: usize,
    pub backfilled: usize,
}

/// Make sure every built-in snippet exists. Existing rows are left alone
/// apart from setting a missing `built_in` flag.
pub fn provision(store: &SqliteStore) -> Result<ProvisionReport, StoreError> {
    let mut report = ProvisionReport::default();
    for builtin in BUILTIN_SNIPPETS {
        let existing = store.find_snippets(BUILTIN_REFERENCE, builtin.name)?;
        if existing.is_empty() {
            let now = Utc::now();
            store.insert_snippet(&Snippet {
                id: nanoid::nanoid!(),
                reference: BUILTIN_REFERENCE.to_string(),
                name: builtin.name.to_string(),
                source: builtin.source.to_string(),
                method: Some(builtin.method.to_string()),
                enabled: true,
                private: false,
                built_in: true,
                secret: None,
                created_at: now,
                updated_at: now,
            })?;
            report.created += 1;
        } else {
            report.backfilled += store.mark_built_in(BUILTIN_REFERENCE, builtin.name)?;
        }
    }
    if report != ProvisionReport::default() {
        tracing::info!(
            "built-in snippets provisioned: {} created, {} backfilled",
            report.created,
            report.backfilled
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_is_idempotent_and_backfills() {
        let store = SqliteStore::open_in_memory().expect("store");
        let now = Utc::now();
        store
            .insert_snippet(&Snippet {
                id: "legacy-ip".into(),
                reference: BUILTIN_REFERENCE.into(),
                name: "ip".into(),
                source: "export default () => 'old'".into(),
                method: Some("GET".into()),
                enabled: true,
                private: false,
                built_in: false,
                secret: None,
                created_at: now,
                updated_at: now,
            })
            .expect("legacy row");

        let first = provision(&store).expect("provision");
        assert_eq!(first, ProvisionReport { created: 2, backfilled: 1 });

        let second = provision(&store).expect("provision again");
        assert_eq!(second, ProvisionReport::default());

        let ip = store.find_snippets(BUILTIN_REFERENCE, "ip").expect("find");
        assert_eq!(ip.len(), 1);
        assert!(ip[0].built_in);
        assert_eq!(ip[0].source, "export default () => 'old'");
    }

    #[test]
    fn canonical_sources_are_embedded() {
        for builtin in BUILTIN_SNIPPETS {
            let source = canonical_source(BUILTIN_REFERENCE, builtin.name).expect("source");
            assert!(source.contains("export default async function handler"));
            compile::lower_module(&format!("built-in/{}.ts", builtin.name), source)
                .expect("built-in lowers");
        }
        assert!(canonical_source("blog", "ip").is_none());
    }
}
