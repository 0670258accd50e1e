//! Serialized hand-out of scans to worker threads.
//!
//! One [`ScanDispenser`] wraps the underlying [`ScanStream`] behind a
//! mutex so that "advance the cursor and take the next scan" is a single
//! atomic step no matter how many workers are pulling.

use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;

use crate::params::{ActivationFilter, SearchParams};
use crate::scan::{RawScan, ScanStream};

/// Which scans of a file a run should process
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScanSelection {
    /// Every scan in the file
    #[default]
    EntireFile,
    /// A single scan number
    SpecificScan(u32),
    /// An inclusive range of scan numbers
    SpecificScanRange(u32, u32),
}

impl ScanSelection {
    /// Interpret a `scan_range` parameter pair; `(0, 0)` selects the
    /// whole file, a zero `last` leaves the range open ended.
    pub fn from_scan_range(first: u32, last: u32) -> Self {
        match (first, last) {
            (0, 0) => Self::EntireFile,
            (f, 0) => Self::SpecificScanRange(f, u32::MAX),
            (f, l) if f == l => Self::SpecificScan(f),
            (f, l) => Self::SpecificScanRange(f, l),
        }
    }

    /// Inclusive scan number bounds of this selection
    pub fn bounds(&self) -> (u32, u32) {
        match *self {
            Self::EntireFile => (0, u32::MAX),
            Self::SpecificScan(n) => (n, n),
            Self::SpecificScanRange(first, last) => (first, last),
        }
    }

    pub fn contains(&self, scan_number: u32) -> bool {
        let (first, last) = self.bounds();
        (first..=last).contains(&scan_number)
    }
}

impl Display for ScanSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntireFile => write!(f, "all scans"),
            Self::SpecificScan(n) => write!(f, "scan {n}"),
            Self::SpecificScanRange(first, u32::MAX) => write!(f, "scans {first}-"),
            Self::SpecificScanRange(first, last) => write!(f, "scans {first}-{last}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScanSelectionParseError {
    #[error("Failed to parse first scan number: {0}")]
    MalformedFirst(ParseIntError),
    #[error("Failed to parse last scan number: {0}")]
    MalformedLast(ParseIntError),
    #[error("Failed to parse scan count: {0}")]
    MalformedCount(ParseIntError),
    #[error("The scan range {0}-{1} ends before it starts")]
    Inverted(u32, u32),
    #[error("Empty scan selection")]
    Empty,
}

/// Parses the command line scan suffix grammar: `N` for one scan,
/// `F-L` for an inclusive range, `F+K` for `K` scans after `F`, and
/// trailing-open forms like `F-`.
impl FromStr for ScanSelection {
    type Err = ScanSelectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ScanSelectionParseError::Empty);
        }
        if let Some((first_s, rest)) = s.split_once('-') {
            let first: u32 = first_s
                .parse()
                .map_err(ScanSelectionParseError::MalformedFirst)?;
            let last: u32 = if rest.is_empty() {
                u32::MAX
            } else {
                rest.parse().map_err(ScanSelectionParseError::MalformedLast)?
            };
            if first > last {
                return Err(ScanSelectionParseError::Inverted(first, last));
            }
            return Ok(Self::from_scan_range(first, last));
        }
        if let Some((first_s, count_s)) = s.split_once('+') {
            let first: u32 = first_s
                .parse()
                .map_err(ScanSelectionParseError::MalformedFirst)?;
            let count: u32 = count_s
                .parse()
                .map_err(ScanSelectionParseError::MalformedCount)?;
            return Ok(Self::from_scan_range(first, first.saturating_add(count)));
        }
        let n: u32 = s.parse().map_err(ScanSelectionParseError::MalformedFirst)?;
        Ok(Self::SpecificScan(n))
    }
}

/// Counts of scans the dispenser withheld from the workers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispenseCounters {
    /// Scans outside the requested MS level
    pub filtered_ms_level: u64,
    /// Scans whose activation method failed the filter
    pub filtered_activation: u64,
    /// Scans before the start of the selection
    pub before_range: u64,
    /// Scans handed out
    pub dispensed: u64,
}

struct DispenserState<S> {
    stream: S,
    exhausted: bool,
    last_yielded: Option<u32>,
    counters: DispenseCounters,
}

/// The one gateway between a scan source and the worker threads
pub struct ScanDispenser<S> {
    inner: Mutex<DispenserState<S>>,
    selection: ScanSelection,
    ms_level: u8,
    activation: ActivationFilter,
}

impl<S: ScanStream> ScanDispenser<S> {
    pub fn new(stream: S, selection: ScanSelection, params: &SearchParams) -> Self {
        Self {
            inner: Mutex::new(DispenserState {
                stream,
                exhausted: false,
                last_yielded: None,
                counters: DispenseCounters::default(),
            }),
            selection,
            ms_level: params.ms_level,
            activation: params.activation_method,
        }
    }

    pub fn selection(&self) -> ScanSelection {
        self.selection
    }

    /// Take the next scan that passes every filter, or `None` once the
    /// stream is exhausted or the cursor has moved past the selection.
    /// A selection entirely beyond the end of the file simply yields
    /// nothing.
    pub fn next(&self) -> Option<RawScan> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.exhausted {
            return None;
        }
        let (first, last) = self.selection.bounds();
        loop {
            let Some(scan) = state.stream.next_scan() else {
                state.exhausted = true;
                return None;
            };
            if scan.scan_number > last {
                // Scan numbers only grow, nothing else can qualify
                state.exhausted = true;
                return None;
            }
            if scan.scan_number < first {
                state.counters.before_range += 1;
                continue;
            }
            // Revisiting a yielded scan number would double-process it
            if state
                .last_yielded
                .is_some_and(|prev| scan.scan_number <= prev)
            {
                continue;
            }
            if scan.ms_level != self.ms_level {
                state.counters.filtered_ms_level += 1;
                continue;
            }
            if !self.activation.accepts(scan.activation) {
                state.counters.filtered_activation += 1;
                continue;
            }
            state.last_yielded = Some(scan.scan_number);
            state.counters.dispensed += 1;
            return Some(scan);
        }
    }

    pub fn counters(&self) -> DispenseCounters {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::ActivationMethod;
    use crate::scan::test_support::{make_scan, VecScanStream};

    fn scans(numbers: &[u32]) -> Vec<RawScan> {
        numbers
            .iter()
            .map(|n| make_scan(*n, 500.0, vec![(200.0, 10.0)]))
            .collect()
    }

    #[test]
    fn test_selection_fromstr() -> Result<(), ScanSelectionParseError> {
        let s: ScanSelection = "1500".parse()?;
        assert_eq!(s, ScanSelection::SpecificScan(1500));

        let s: ScanSelection = "1000-1500".parse()?;
        assert_eq!(s, ScanSelection::SpecificScanRange(1000, 1500));

        let s: ScanSelection = "1000-".parse()?;
        assert_eq!(s, ScanSelection::SpecificScanRange(1000, u32::MAX));

        let s: ScanSelection = "1000+10".parse()?;
        assert_eq!(s, ScanSelection::SpecificScanRange(1000, 1010));

        assert!(matches!(
            "1500-1000".parse::<ScanSelection>(),
            Err(ScanSelectionParseError::Inverted(1500, 1000))
        ));
        assert!(matches!(
            "abc".parse::<ScanSelection>(),
            Err(ScanSelectionParseError::MalformedFirst(_))
        ));
        assert!(matches!(
            "10+x".parse::<ScanSelection>(),
            Err(ScanSelectionParseError::MalformedCount(_))
        ));
        Ok(())
    }

    #[test]
    fn test_from_scan_range() {
        assert_eq!(
            ScanSelection::from_scan_range(0, 0),
            ScanSelection::EntireFile
        );
        assert_eq!(
            ScanSelection::from_scan_range(7, 7),
            ScanSelection::SpecificScan(7)
        );
        assert_eq!(
            ScanSelection::from_scan_range(5, 0),
            ScanSelection::SpecificScanRange(5, u32::MAX)
        );
    }

    #[test]
    fn test_range_dispensing_is_exact() {
        let stream = VecScanStream::new(scans(&[998, 999, 1000, 1001, 1500, 1501, 2000]));
        let params = SearchParams::default();
        let dispenser = ScanDispenser::new(
            stream,
            ScanSelection::SpecificScanRange(1000, 1500),
            &params,
        );
        let mut seen = Vec::new();
        while let Some(scan) = dispenser.next() {
            seen.push(scan.scan_number);
        }
        assert_eq!(seen, vec![1000, 1001, 1500]);
        let counters = dispenser.counters();
        assert_eq!(counters.before_range, 2);
        assert_eq!(counters.dispensed, 3);
        // next() after exhaustion stays exhausted
        assert!(dispenser.next().is_none());
    }

    #[test]
    fn test_range_past_eof_yields_nothing() {
        let stream = VecScanStream::new(scans(&[1, 2, 3]));
        let params = SearchParams::default();
        let dispenser =
            ScanDispenser::new(stream, ScanSelection::SpecificScanRange(100, 200), &params);
        assert!(dispenser.next().is_none());
    }

    #[test]
    fn test_duplicate_scan_numbers_skipped() {
        let stream = VecScanStream::new(scans(&[5, 5, 6, 6, 7]));
        let params = SearchParams::default();
        let dispenser = ScanDispenser::new(stream, ScanSelection::EntireFile, &params);
        let mut seen = Vec::new();
        while let Some(scan) = dispenser.next() {
            seen.push(scan.scan_number);
        }
        assert_eq!(seen, vec![5, 6, 7]);
    }

    #[test]
    fn test_ms_level_and_activation_filters() {
        let mut all = scans(&[1, 2, 3, 4]);
        all[1].ms_level = 1;
        all[2].activation = ActivationMethod::CID;
        let stream = VecScanStream::new(all);
        let mut params = SearchParams::default();
        params.activation_method = ActivationFilter::Only(ActivationMethod::HCD);
        let dispenser = ScanDispenser::new(stream, ScanSelection::EntireFile, &params);
        let mut seen = Vec::new();
        while let Some(scan) = dispenser.next() {
            seen.push(scan.scan_number);
        }
        assert_eq!(seen, vec![1, 4]);
        let counters = dispenser.counters();
        assert_eq!(counters.filtered_ms_level, 1);
        assert_eq!(counters.filtered_activation, 1);
    }

    #[test]
    fn test_concurrent_draining_yields_each_scan_once() {
        let stream = VecScanStream::new(scans(&(1..=200).collect::<Vec<_>>()));
        let params = SearchParams::default();
        let dispenser = ScanDispenser::new(stream, ScanSelection::EntireFile, &params);
        let seen = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(scan) = dispenser.next() {
                        seen.lock().unwrap().push(scan.scan_number);
                    }
                });
            }
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }
}
