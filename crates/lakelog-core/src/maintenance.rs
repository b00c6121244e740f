//! Table maintenance: compaction of small files and physical cleanup.
//!
//! - [`optimize`]: bin-packs small live files per partition and rewrites
//!   each bin into one file. The logical table contents do not change.
//! - [`vacuum`]: deletes files that no retained version references and
//!   raises the history floor accordingly.
pub mod optimize;
pub mod vacuum;

pub use optimize::{OptimizeMetrics, OptimizeOptions};
pub use vacuum::{VacuumOptions, VacuumReport};
