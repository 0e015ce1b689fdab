// wal/mod.rs
// Write-ahead log: record format, segmented appender, streaming reader,
// checkpointing and committed-transaction replay.

pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use reader::WalSegmentReader;
pub use record::{WalRecord, WalRecordBody, WalRecordKind, MAX_WAL_BODY_SIZE, WAL_HEADER_SIZE};
pub use recovery::{replay, RecoveredOp, RecoveryStats};
pub use writer::{list_segments, read_checkpoint, CheckpointInfo, WalManager};
