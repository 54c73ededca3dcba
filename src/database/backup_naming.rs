//! Backup naming module for mapping an authenticated user to their remote
//! backup object
//!
//! Each user owns exactly one remote object, `<userId>/database-backup.db`.
//! The user id becomes a path segment, so it has to be a single, non-empty
//! segment with no traversal.

use crate::auth::User;
use crate::database::{BackupError, Result};

/// File name of the backup object inside a user's namespace
pub const BACKUP_FILE_NAME: &str = "database-backup.db";

/// Validate a user id for use as a storage namespace
pub fn backup_namespace(user: &User) -> Result<&str> {
    let id = user.id.as_str();

    if id.is_empty() || id.trim() != id {
        return Err(BackupError::Config(format!(
            "user id {:?} cannot be used as a backup namespace",
            id
        )));
    }

    if id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(BackupError::Config(format!(
            "user id {:?} is not a single path segment",
            id
        )));
    }

    Ok(id)
}

/// Get the remote path of the backup object for the given user
pub fn remote_backup_path(user: &User) -> Result<String> {
    let namespace = backup_namespace(user)?;
    Ok(format!("{}/{}", namespace, BACKUP_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> User {
        User { id: id.to_string() }
    }

    #[test]
    fn test_remote_backup_path() {
        assert_eq!(
            remote_backup_path(&user("alice")).unwrap(),
            "alice/database-backup.db"
        );
    }

    #[test]
    fn test_rejects_invalid_namespaces() {
        for id in ["", " alice", "..", ".", "a/b", "a\\b"] {
            assert!(
                matches!(remote_backup_path(&user(id)), Err(BackupError::Config(_))),
                "{:?} should be rejected",
                id
            );
        }
    }
}
