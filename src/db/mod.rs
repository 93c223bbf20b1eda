//! On-disk flow database
//!
//! Rotated flow snapshots are written as columnar, LZ4-compressed block
//! files, one file per attribute under `<db_path>/<iface>/<YYYYMMDD>/`.

pub mod block_file;
pub mod writeout;

pub use block_file::{BlockFile, BlockFileError, HEADER_SIZE, NUM_ELEMENTS};
pub use writeout::{WriteoutHandler, ATTRIBUTES};
