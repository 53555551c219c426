//! PostgreSQL extensions declared in the cluster spec

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::crd::{ExtensionSpec, ExtensionStatus};
use crate::postgres::{InstalledExtension, InstanceClient};

/// Extension as reported by the database it belongs to
fn find<'a>(installed: &'a [InstalledExtension], name: &str) -> Option<&'a InstalledExtension> {
    installed.iter().find(|e| e.name == name)
}

/// True when the extension exists at the requested version, if any
pub fn is_satisfied(wanted: &ExtensionSpec, installed: &[InstalledExtension]) -> bool {
    find(installed, &wanted.name)
        .is_some_and(|e| wanted.version.as_ref().is_none_or(|v| *v == e.version))
}

/// Group extensions by target database
pub fn by_database<'a>(
    wanted: &'a [ExtensionSpec],
    app_database: &'a str,
) -> BTreeMap<&'a str, Vec<&'a ExtensionSpec>> {
    let mut grouped: BTreeMap<&str, Vec<&ExtensionSpec>> = BTreeMap::new();
    for ext in wanted {
        grouped
            .entry(ext.database.as_deref().unwrap_or(app_database))
            .or_default()
            .push(ext);
    }
    grouped
}

/// Create missing extensions on the primary and report per-extension status
///
/// Failures are recorded in the status rather than failing the pass.
pub async fn reconcile_extensions(
    client: &dyn InstanceClient,
    namespace: &str,
    primary: &str,
    app_database: &str,
    wanted: &[ExtensionSpec],
) -> Vec<ExtensionStatus> {
    let mut statuses = Vec::with_capacity(wanted.len());

    for (database, extensions) in by_database(wanted, app_database) {
        let installed = match client.list_extensions(namespace, primary, database).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(instance = primary, database, error = %e, "failed to list extensions");
                statuses.extend(extensions.iter().map(|ext| ExtensionStatus {
                    name: ext.name.clone(),
                    applied: false,
                    version: None,
                    message: Some(e.to_string()),
                }));
                continue;
            }
        };

        for ext in extensions {
            if is_satisfied(ext, &installed) {
                statuses.push(ExtensionStatus {
                    name: ext.name.clone(),
                    applied: true,
                    version: find(&installed, &ext.name).map(|e| e.version.clone()),
                    message: None,
                });
                continue;
            }

            debug!(instance = primary, database, extension = %ext.name, "creating extension");
            let status = match client.create_extension(namespace, primary, database, ext).await {
                Ok(()) => ExtensionStatus {
                    name: ext.name.clone(),
                    applied: true,
                    version: ext.version.clone(),
                    message: None,
                },
                Err(e) => {
                    warn!(instance = primary, extension = %ext.name, error = %e, "failed to create extension");
                    ExtensionStatus {
                        name: ext.name.clone(),
                        applied: false,
                        version: find(&installed, &ext.name).map(|e| e.version.clone()),
                        message: Some(e.to_string()),
                    }
                }
            };
            statuses.push(status);
        }
    }

    statuses
}
