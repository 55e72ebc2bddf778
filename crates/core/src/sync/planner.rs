//! Plan computation
//!
//! Pure function of the two inventories; performs no I/O.

use std::collections::{HashMap, HashSet};

use super::{Comparator, LocalFile, Operation, OperationKind, RemoteFile};
use crate::path::join_key;

/// Diff the inventories into an ordered plan
///
/// Uploads come first, then skips, then deletes, each group sorted by
/// remote key. Deletes are only planned with `delete_extra`.
pub fn plan(
    local: &[LocalFile],
    remote: &[RemoteFile],
    prefix: &str,
    delete_extra: bool,
    comparator: &dyn Comparator,
) -> Vec<Operation> {
    let remote_by_path: HashMap<&str, &RemoteFile> =
        remote.iter().map(|r| (r.relative.as_str(), r)).collect();

    let mut uploads = Vec::new();
    let mut skips = Vec::new();

    for file in local {
        let remote_key = join_key(prefix, &file.relative);
        let (kind, reason) = match remote_by_path.get(file.relative.as_str()) {
            None => (OperationKind::Upload, "new".to_string()),
            Some(existing) => match comparator.changed(file, existing) {
                Some(reason) => (OperationKind::Upload, reason),
                None => (OperationKind::Skip, "unchanged".to_string()),
            },
        };

        let operation = Operation {
            kind,
            local_path: Some(file.path.clone()),
            remote_key,
            size: file.size,
            reason,
        };
        match kind {
            OperationKind::Upload => uploads.push(operation),
            _ => skips.push(operation),
        }
    }

    let mut deletes = Vec::new();
    if delete_extra {
        let local_paths: HashSet<&str> = local.iter().map(|l| l.relative.as_str()).collect();
        deletes.extend(
            remote
                .iter()
                .filter(|r| !local_paths.contains(r.relative.as_str()))
                .map(|r| Operation {
                    kind: OperationKind::Delete,
                    local_path: None,
                    remote_key: r.key.clone(),
                    size: r.size,
                    reason: "not present locally".to_string(),
                }),
        );
    }

    for group in [&mut uploads, &mut skips, &mut deletes] {
        group.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
    }

    let mut operations = uploads;
    operations.append(&mut skips);
    operations.append(&mut deletes);
    operations
}
