pub mod compress;
pub mod db_dump;
pub mod retention;
pub mod workspace;

use chrono::NaiveDate;

use crate::models::Cadence;

pub use db_dump::{DumpFile, Dumper, ProcessDumper};
pub use retention::RetentionEngine;
pub use workspace::TempWorkspace;

const BACKUP_SUFFIX: &str = ".sql.gz";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// `{database}_{YYYY-MM-DD}.sql.gz`. Retention matching depends on this exact shape.
pub fn backup_filename(database: &str, date: NaiveDate) -> String {
    format!("{}_{}{}", database, date.format(DATE_FORMAT), BACKUP_SUFFIX)
}

/// Parses the date out of a backup file name belonging to `database`.
///
/// Returns `None` for names of other databases and for names whose date
/// component does not parse (e.g. `mydb_not-a-date.sql.gz`).
pub fn parse_backup_date(filename: &str, database: &str) -> Option<NaiveDate> {
    let date_part = filename
        .strip_prefix(database)?
        .strip_prefix('_')?
        .strip_suffix(BACKUP_SUFFIX)?;
    NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()
}

/// Folder where a job's files live: `{base}/{Cadence}`, or just `{Cadence}`
/// when the base path is empty.
pub fn schedule_folder(base_folder_path: &str, cadence: Cadence) -> String {
    let base = base_folder_path.trim_end_matches('/');
    if base.is_empty() {
        cadence.folder_name().to_string()
    } else {
        format!("{}/{}", base, cadence.folder_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_follows_convention() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(backup_filename("mydb", date), "mydb_2024-03-09.sql.gz");
    }

    #[test]
    fn parse_date_from_own_files_only() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(parse_backup_date("mydb_2024-03-09.sql.gz", "mydb"), Some(date));
        assert_eq!(parse_backup_date("mydb_not-a-date.sql.gz", "mydb"), None);
        assert_eq!(parse_backup_date("other_2024-03-09.sql.gz", "mydb"), None);
        assert_eq!(parse_backup_date("mydb_2024-03-09.sql", "mydb"), None);
    }

    #[test]
    fn prefix_database_does_not_claim_longer_names() {
        // "app" must not match files of "app_v2"
        assert_eq!(parse_backup_date("app_v2_2024-03-09.sql.gz", "app"), None);
    }

    #[test]
    fn schedule_folder_capitalizes_cadence() {
        assert_eq!(schedule_folder("backups", Cadence::Daily), "backups/Daily");
        assert_eq!(schedule_folder("backups/", Cadence::Weekly), "backups/Weekly");
        assert_eq!(schedule_folder("", Cadence::Monthly), "Monthly");
    }
}
