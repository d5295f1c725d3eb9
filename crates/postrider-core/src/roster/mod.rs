//! Recipient source
//!
//! The engine treats the recipient list as an opaque tabular store behind
//! the [`RecipientSource`] contract: an ordered read, a per-record status
//! write, and a guarantee that the store snapshots itself before its first
//! mutation. The in-repo realization is a CSV file.

pub mod csv;

pub use self::csv::CsvRoster;

use postrider_common::types::{RecipientRecord, RecordId, SendStatus};
use postrider_common::Result;

/// Contract between the engine and the recipient store.
pub trait RecipientSource {
    /// The ordered sequence of records still awaiting delivery.
    fn read(&self) -> Result<Vec<RecipientRecord>>;

    /// Record a terminal status for one record. The store must preserve an
    /// immutable snapshot of its prior state before the first write.
    fn write_status(&mut self, id: RecordId, status: SendStatus) -> Result<()>;
}
