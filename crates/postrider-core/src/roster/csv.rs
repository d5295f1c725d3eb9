//! CSV-backed recipient roster
//!
//! Columns: `email, var1, var2, var3, attachment1, attachment2, status`.
//! A blank or `0` status marks a row pending; `1` means sent and anything
//! else means a previous run gave up on it. Statuses are written back in
//! place; the pristine file is copied to a timestamped `.bak` sibling before
//! the first mutation.

use super::RecipientSource;
use postrider_common::types::{RecipientRecord, RecordId, SendStatus, TemplateVars};
use postrider_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CsvRow {
    email: String,
    #[serde(default)]
    var1: String,
    #[serde(default)]
    var2: String,
    #[serde(default)]
    var3: String,
    #[serde(default)]
    attachment1: String,
    #[serde(default)]
    attachment2: String,
    #[serde(default)]
    status: String,
}

impl CsvRow {
    /// Blank or `0` means awaiting delivery; `1` means sent, `failed` means
    /// the last run gave up. Failed rows are not picked up again until the
    /// operator resets their status.
    fn is_pending(&self) -> bool {
        matches!(self.status.trim(), "" | "0")
    }
}

/// CSV recipient roster.
pub struct CsvRoster {
    path: PathBuf,
    rows: Vec<CsvRow>,
    backup_done: bool,
}

impl CsvRoster {
    /// Load the roster file, keeping every row (sent ones included) so a
    /// write-back preserves the full sheet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| Error::Roster(format!("failed to open roster {:?}: {}", path, e)))?;

        let mut rows = Vec::new();
        for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|e| {
                Error::Roster(format!("roster {:?} row {}: {}", path, line + 2, e))
            })?;
            rows.push(row);
        }

        info!("loaded {} roster rows from {:?}", rows.len(), path);
        Ok(Self {
            path,
            rows,
            backup_done: false,
        })
    }

    /// Path of the backup that would be (or was) written for this roster.
    fn backup_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        self.path.with_extension(format!("csv.{}.bak", stamp))
    }

    fn ensure_backup(&mut self) -> Result<()> {
        if self.backup_done {
            return Ok(());
        }
        let backup = self.backup_path();
        std::fs::copy(&self.path, &backup)
            .map_err(|e| Error::Roster(format!("failed to back up roster to {:?}: {}", backup, e)))?;
        debug!("roster backed up to {:?}", backup);
        self.backup_done = true;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.path)
            .map_err(|e| Error::Roster(format!("failed to rewrite roster: {}", e)))?;
        for row in &self.rows {
            writer
                .serialize(row)
                .map_err(|e| Error::Roster(format!("failed to write roster row: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| Error::Roster(format!("failed to flush roster: {}", e)))?;
        Ok(())
    }

    fn attachments_of(row: &CsvRow) -> Vec<String> {
        [&row.attachment1, &row.attachment2]
            .into_iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl RecipientSource for CsvRoster {
    fn read(&self) -> Result<Vec<RecipientRecord>> {
        let records = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_pending())
            .map(|(id, row)| RecipientRecord {
                id,
                email: row.email.trim().to_string(),
                vars: TemplateVars {
                    var1: row.var1.clone(),
                    var2: row.var2.clone(),
                    var3: row.var3.clone(),
                },
                attachments: Self::attachments_of(row),
                sent: false,
            })
            .collect();
        Ok(records)
    }

    fn write_status(&mut self, id: RecordId, status: SendStatus) -> Result<()> {
        if id >= self.rows.len() {
            return Err(Error::Roster(format!("no roster row with id {}", id)));
        }
        self.ensure_backup()?;
        self.rows[id].status = match status {
            SendStatus::Sent => "1".to_string(),
            SendStatus::Failed => "failed".to_string(),
        };
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "email,var1,var2,var3,attachment1,attachment2,status\n\
        a@example.com,Alice,,,doc.pdf,,\n\
        b@example.com,Bob,,,,,1\n\
        c@example.com,Carol,Acme,,,,0\n";

    fn temp_roster(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("postrider-roster-{}.csv", uuid::Uuid::new_v4()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_skips_sent_rows_in_order() {
        let path = temp_roster(SAMPLE);
        let roster = CsvRoster::open(&path).unwrap();
        let records = roster.read().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].email, "a@example.com");
        assert_eq!(records[0].id, 0);
        assert_eq!(records[0].attachments, vec!["doc.pdf".to_string()]);
        assert_eq!(records[1].email, "c@example.com");
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].vars.var2, "Acme");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_status_persists_and_backs_up() {
        let path = temp_roster(SAMPLE);
        let dir = path.parent().unwrap().to_path_buf();
        let stem = path.file_stem().unwrap().to_string_lossy().to_string();

        let mut roster = CsvRoster::open(&path).unwrap();
        roster.write_status(0, SendStatus::Sent).unwrap();
        roster.write_status(2, SendStatus::Failed).unwrap();

        // Reopening sees the new statuses: the sent row is done and the
        // failed row is not picked up again without an explicit re-queue.
        let reloaded = CsvRoster::open(&path).unwrap();
        let records = reloaded.read().unwrap();
        assert!(records.is_empty());

        // Exactly one backup of the pristine content exists.
        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with(&stem) && n.ends_with(".bak")
                    })
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(backups.len(), 1);
        let backup_content = std::fs::read_to_string(&backups[0]).unwrap();
        assert_eq!(backup_content, SAMPLE);

        std::fs::remove_file(&path).unwrap();
        std::fs::remove_file(&backups[0]).unwrap();
    }

    #[test]
    fn test_write_status_unknown_row_errors() {
        let path = temp_roster(SAMPLE);
        let mut roster = CsvRoster::open(&path).unwrap();
        assert!(roster.write_status(99, SendStatus::Sent).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_missing_file_errors() {
        assert!(CsvRoster::open("/nonexistent/roster.csv").is_err());
    }
}
