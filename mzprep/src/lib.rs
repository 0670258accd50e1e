//! Spectral preprocessing for fast cross-correlation peptide search.
//!
//! This crate turns centroided tandem mass spectra into the binned,
//! normalized, background-subtracted arrays a fast cross-correlation
//! scorer consumes, with a fixed memory footprint: a pool of reusable
//! scratch buffers caps the number of spectra in flight, and a bounded
//! output channel caps how far preprocessing may run ahead of scoring.
//!
//! The usual entry point is [`dispatch::PreprocessingContext`]:
//!
//! ```no_run
//! use mzdata::prelude::*;
//! use mzprep::dispatch::PreprocessingContext;
//! use mzprep::dispense::ScanSelection;
//! use mzprep::params::SearchParams;
//! use mzprep::scan::MzScanStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = mzdata::MZReader::open_path("small.mzML")?;
//! let ctx = PreprocessingContext::new(SearchParams::default())?;
//! let (tx, rx) = ctx.query_channel();
//! let consumer = std::thread::spawn(move || rx.iter().count());
//! let summary = ctx.load_and_preprocess_spectra(
//!     MzScanStream::new(reader),
//!     ScanSelection::EntireFile,
//!     tx,
//! )?;
//! println!("{} queries", consumer.join().unwrap());
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod dispense;
pub mod params;
pub mod pool;
pub mod preprocess;
pub mod progress;
pub mod scan;

pub use crate::dispatch::{PreprocessError, PreprocessingContext};
pub use crate::dispense::ScanSelection;
pub use crate::params::SearchParams;
pub use crate::preprocess::{Outcome, PreprocessedQuery, SkipReason};
pub use crate::progress::RunSummary;
