use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::Value;

use crate::db::Db;
use crate::models::UserRecord;

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub created: usize,
    pub errors: Vec<String>,
}

pub fn import_users_from_file(db: &Db, path: &Path) -> Result<ImportReport> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    import_users(db, &raw)
}

/// Imports a JSON array of users. Records are handled one by one inside a
/// single transaction; a bad record is reported and skipped.
pub fn import_users(db: &Db, raw: &str) -> Result<ImportReport> {
    let entries: Vec<Value> = serde_json::from_str(raw).context("Expected a JSON array of users")?;

    db.in_transaction(|db| {
        let mut report = ImportReport::default();

        for entry in entries {
            let id_hint = entry
                .get("id")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());

            match import_one(db, entry) {
                Ok(created) => {
                    report.imported += 1;
                    if created {
                        report.created += 1;
                    }
                }
                Err(e) => {
                    warn!("Skipping user {id_hint}: {e:#}");
                    report.errors.push(format!("user id {id_hint}: {e:#}"));
                }
            }
        }

        info!(
            "Imported {} users ({} new), {} errors",
            report.imported,
            report.created,
            report.errors.len()
        );
        Ok(report)
    })
}

fn import_one(db: &Db, entry: Value) -> Result<bool> {
    let record: UserRecord = serde_json::from_value(entry)?;
    let group_id = db.get_or_create_group(&record.group, &format!("Group {}", record.group))?;
    db.upsert_user(record.id, &record.email, &record.phone, &record.telegram, group_id)
}

pub fn export_users(db: &Db, path: &Path) -> Result<usize> {
    let records = db.user_records()?;
    let json = serde_json::to_string_pretty(&records)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"[
        {"id": 1, "email": "a@x.io", "phone": "+1", "telegram": "@a", "group": "staff"},
        {"id": 2, "email": "b@x.io", "phone": "+2", "telegram": "@b", "group": "guests"},
        {"id": "three", "email": "c@x.io", "phone": "+3", "telegram": "@c", "group": "staff"},
        {"email": "d@x.io"}
    ]"#;

    #[test]
    fn bad_records_are_skipped_not_fatal() {
        let db = Db::open_in_memory().unwrap();
        let report = import_users(&db, USERS).unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("user id \"three\":"), "{:?}", report.errors);
        assert!(report.errors[1].starts_with("user id ?:"), "{:?}", report.errors);

        let groups = db.list_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|(g, _)| g.description == "Group staff"));
    }

    #[test]
    fn reimport_updates_existing_users() {
        let db = Db::open_in_memory().unwrap();
        import_users(&db, USERS).unwrap();
        let again = import_users(
            &db,
            r#"[{"id": 1, "email": "new@x.io", "phone": "+1", "telegram": "@a", "group": "vip"}]"#,
        )
        .unwrap();
        assert_eq!(again.imported, 1);
        assert_eq!(again.created, 0);

        let users = db.list_users(None).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].email, "new@x.io");
    }

    #[test]
    fn non_array_input_is_an_error() {
        let db = Db::open_in_memory().unwrap();
        assert!(import_users(&db, r#"{"id": 1}"#).is_err());
    }

    #[test]
    fn export_writes_import_shape() {
        let db = Db::open_in_memory().unwrap();
        import_users(&db, USERS).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        assert_eq!(export_users(&db, &path).unwrap(), 2);
        let back: Vec<UserRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back[1].group, "guests");
        assert_eq!(back[0].telegram, "@a");
    }
}
