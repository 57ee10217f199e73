//! Namespaced key inspection and cleanup

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use remedy_lib::store::{CoordinationStore, KeyNamespace};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{format_ttl, print_info, print_json, print_success, print_table, OutputFormat};

/// Which key namespaces a command touches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum NamespaceScope {
    Cooldown,
    Dedup,
    #[default]
    All,
}

impl NamespaceScope {
    pub fn namespaces(&self) -> Vec<KeyNamespace> {
        match self {
            NamespaceScope::Cooldown => vec![KeyNamespace::Cooldown],
            NamespaceScope::Dedup => vec![KeyNamespace::Dedup],
            NamespaceScope::All => KeyNamespace::ALL.to_vec(),
        }
    }
}

/// Row for the key listing table
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct KeyRow {
    #[tabled(rename = "Namespace")]
    pub namespace: String,
    #[tabled(rename = "Key")]
    pub key: String,
    #[tabled(rename = "Expires In")]
    #[serde(skip)]
    pub expires_in: String,
    #[tabled(skip)]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub dry_run: bool,
    pub matched: Vec<String>,
    pub deleted: usize,
}

/// Live keys in the selected namespaces, with their remaining TTL
pub async fn collect_keys(
    store: &dyn CoordinationStore,
    scope: NamespaceScope,
) -> Result<Vec<KeyRow>> {
    let mut rows = Vec::new();
    for namespace in scope.namespaces() {
        let keys = store
            .keys(namespace.prefix())
            .await
            .with_context(|| format!("Failed to list {} keys", namespace))?;
        for key in keys {
            // Expired between listing and reading
            let Some(entry) = store.get(&key).await? else {
                continue;
            };
            rows.push(KeyRow {
                namespace: namespace.to_string(),
                expires_in: format_ttl(entry.ttl()),
                ttl_ms: entry.ttl_ms,
                key,
            });
        }
    }
    Ok(rows)
}

/// Delete every live key in the selected namespaces
///
/// With `dry_run` the matching keys are reported and nothing is deleted.
pub async fn purge(
    store: &dyn CoordinationStore,
    scope: NamespaceScope,
    dry_run: bool,
) -> Result<PurgeReport> {
    let mut matched = Vec::new();
    for namespace in scope.namespaces() {
        matched.extend(
            store
                .keys(namespace.prefix())
                .await
                .with_context(|| format!("Failed to list {} keys", namespace))?,
        );
    }

    let mut deleted = 0;
    if !dry_run {
        for key in &matched {
            if store
                .delete(key)
                .await
                .with_context(|| format!("Failed to delete {}", key))?
            {
                deleted += 1;
            }
        }
    }

    Ok(PurgeReport {
        dry_run,
        matched,
        deleted,
    })
}

/// `keys list`
pub async fn list_keys(
    store: &dyn CoordinationStore,
    scope: NamespaceScope,
    format: OutputFormat,
) -> Result<()> {
    let rows = collect_keys(store, scope).await?;
    print_table(&rows, format)
}

/// `keys purge`
pub async fn purge_keys(
    store: &dyn CoordinationStore,
    scope: NamespaceScope,
    dry_run: bool,
    format: OutputFormat,
) -> Result<()> {
    let report = purge(store, scope, dry_run).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            if report.matched.is_empty() {
                print_info("No keys to purge");
            } else if report.dry_run {
                println!("{}", "Dry run, these keys would be deleted:".bold());
                for key in &report.matched {
                    println!("  {}", key.cyan());
                }
                print_info(&format!("{} key(s) matched", report.matched.len()));
            } else {
                print_success(&format!("Deleted {} key(s)", report.deleted));
            }
        }
    }
    Ok(())
}
