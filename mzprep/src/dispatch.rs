//! Fans a scan stream out over a bounded set of preprocessing workers.
//!
//! Memory is bounded twice over: a worker cannot touch a spectrum
//! without holding one of the pool's buffer sets, and finished queries
//! go into a bounded channel sized by `spectrum_batch_size`, so a slow
//! consumer throttles the whole pipeline instead of growing a backlog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::dispense::{ScanDispenser, ScanSelection};
use crate::params::{ParamsError, SearchParams};
use crate::pool::{BufferPool, PoolError};
use crate::preprocess::{Outcome, PreprocessedQuery, Preprocessor};
use crate::progress::RunSummary;
use crate::scan::ScanStream;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Tracks whether the scan source has been drained. Combined with the
/// pool's outstanding-lease count this answers "is everything done",
/// without any polling loop.
#[derive(Default)]
pub struct CompletionTracker {
    exhausted: Mutex<bool>,
    cond: Condvar,
}

impl CompletionTracker {
    fn mark_exhausted(&self) {
        let mut exhausted = self.exhausted.lock().unwrap_or_else(|e| e.into_inner());
        *exhausted = true;
        self.cond.notify_all();
    }

    pub fn is_exhausted(&self) -> bool {
        *self.exhausted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park until the scan source has been drained
    pub fn wait_exhausted(&self) {
        let mut exhausted = self.exhausted.lock().unwrap_or_else(|e| e.into_inner());
        while !*exhausted {
            exhausted = self.cond.wait(exhausted).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn reset(&self) {
        let mut exhausted = self.exhausted.lock().unwrap_or_else(|e| e.into_inner());
        *exhausted = false;
    }
}

/// Everything one preprocessing run needs, owned in one place and passed
/// by reference. Buffers are allocated once here and reused across every
/// file the context processes.
pub struct PreprocessingContext {
    params: SearchParams,
    pool: BufferPool,
    tracker: CompletionTracker,
    abort: AtomicBool,
}

impl PreprocessingContext {
    /// Validate `params` and allocate one buffer set per worker. Both
    /// failures are fatal to the run, nothing is retried.
    pub fn new(params: SearchParams) -> Result<Self, PreprocessError> {
        params.validate()?;
        let workers = params.worker_count();
        let pool = BufferPool::allocate(workers, params.bin_capacity())?;
        debug!(
            "Allocated {} buffer sets of {} bins",
            pool.capacity(),
            pool.bin_capacity()
        );
        Ok(Self {
            params,
            pool,
            tracker: CompletionTracker::default(),
            abort: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn worker_count(&self) -> usize {
        self.pool.capacity()
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Ask the workers to wind down at their next dispatch boundary
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// The bounded hand-off channel to the consumer, sized so at most
    /// `spectrum_batch_size` finished queries are ever buffered
    pub fn query_channel(&self) -> (Sender<Box<PreprocessedQuery>>, Receiver<Box<PreprocessedQuery>>) {
        bounded(self.params.spectrum_batch_size)
    }

    /// True once the scan source is drained and every buffer set is home
    pub fn done_processing_all_spectra(&self) -> bool {
        self.tracker.is_exhausted() && self.pool.in_use() == 0
    }

    /// Park until [`Self::done_processing_all_spectra`] holds. Once the
    /// source is exhausted the lease count can only fall, so waiting on
    /// the two conditions in sequence is race free.
    pub fn wait_until_done(&self) {
        self.tracker.wait_exhausted();
        self.pool.wait_until_idle();
    }

    /// Make the context reusable for the next input file
    pub fn reset(&self) {
        self.tracker.reset();
        self.abort.store(false, Ordering::Relaxed);
    }

    /// Drain `stream` through the preprocessing workers, sending every
    /// query produced into `sink`. Returns once all workers have wound
    /// down, with the run's accounting. A consumer that hangs up stops
    /// the run early but is not an error.
    pub fn load_and_preprocess_spectra<S>(
        &self,
        stream: S,
        selection: ScanSelection,
        sink: Sender<Box<PreprocessedQuery>>,
    ) -> Result<RunSummary, PreprocessError>
    where
        S: ScanStream + Send,
    {
        let (first, last) = selection.bounds();
        if first > last {
            return Err(ParamsError::ScanRangeInverted(first, last).into());
        }
        self.tracker.reset();

        let dispenser = ScanDispenser::new(stream, selection, &self.params);
        let mut summary = RunSummary::default();

        thread::scope(|s| {
            let handles: Vec<_> = (0..self.worker_count())
                .map(|worker_index| {
                    let dispenser = &dispenser;
                    let sink = sink.clone();
                    s.spawn(move || self.worker_loop(worker_index, dispenser, sink))
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(local) => summary += local,
                    Err(_) => {
                        warn!("A preprocessing worker panicked, its tally is lost");
                    }
                }
            }
        });
        drop(sink);

        self.tracker.mark_exhausted();

        let counters = dispenser.counters();
        summary.filtered_ms_level = counters.filtered_ms_level as usize;
        summary.filtered_activation = counters.filtered_activation as usize;
        Ok(summary)
    }

    fn worker_loop<S: ScanStream>(
        &self,
        worker_index: usize,
        dispenser: &ScanDispenser<S>,
        sink: Sender<Box<PreprocessedQuery>>,
    ) -> RunSummary {
        let preprocessor = Preprocessor::new(&self.params);
        let mut local = RunSummary::default();
        loop {
            if self.aborted() {
                break;
            }
            // Hold a buffer set before taking a scan, so backpressure
            // lands on the reader instead of on spectra in limbo
            let mut lease = self.pool.acquire();
            let Some(scan) = dispenser.next() else {
                break;
            };
            trace!(
                "Worker {worker_index} preprocessing scan {}",
                scan.scan_number
            );
            match preprocessor.preprocess(&scan, &mut lease) {
                Outcome::Preprocessed(query) => {
                    local.queries += 1;
                    if query.charge_defaulted {
                        local.charges_defaulted += 1;
                    }
                    // Return the buffers before possibly blocking on a
                    // full sink
                    drop(lease);
                    if sink.send(query).is_err() {
                        debug!("The query consumer hung up, winding down");
                        self.request_abort();
                        break;
                    }
                }
                Outcome::Skipped(reason) => {
                    trace!("Skipping scan {}: {reason:?}", scan.scan_number);
                    local.tally_skip(reason);
                }
            }
        }
        local
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::test_support::{make_scan, VecScanStream};
    use crate::scan::RawScan;

    fn make_params() -> SearchParams {
        let mut params = SearchParams::default();
        params.fragment_bin_tol = 1.0;
        params.minimum_peaks = 2;
        params.digest_mass_range = (100.0, 2000.0);
        params.num_threads = 4;
        params.spectrum_batch_size = 64;
        params
    }

    fn make_scans(count: u32) -> Vec<RawScan> {
        (1..=count)
            .map(|n| {
                make_scan(
                    n,
                    450.0,
                    vec![(100.0, 30.0), (200.5, 45.0), (350.0, 20.0), (500.0, 10.0)],
                )
            })
            .collect()
    }

    #[test_log::test]
    fn test_full_run_accounts_for_every_scan() -> Result<(), PreprocessError> {
        let ctx = PreprocessingContext::new(make_params())?;
        let (tx, rx) = ctx.query_channel();

        let summary = thread::scope(|s| {
            let consumer = s.spawn(move || {
                let mut numbers: Vec<u32> = rx.iter().map(|q| q.scan_number).collect();
                numbers.sort_unstable();
                numbers
            });
            let summary = ctx.load_and_preprocess_spectra(
                VecScanStream::new(make_scans(100)),
                ScanSelection::EntireFile,
                tx,
            );
            let numbers = consumer.join().unwrap();
            assert_eq!(numbers, (1..=100).collect::<Vec<_>>());
            summary
        })?;

        assert_eq!(summary.queries, 100);
        assert_eq!(summary.skipped(), 0);
        assert!(ctx.done_processing_all_spectra());
        assert_eq!(ctx.pool().in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_specific_scan_range_run() -> Result<(), PreprocessError> {
        let ctx = PreprocessingContext::new(make_params())?;
        let (tx, rx) = ctx.query_channel();

        thread::scope(|s| {
            let consumer = s.spawn(move || {
                let mut numbers: Vec<u32> = rx.iter().map(|q| q.scan_number).collect();
                numbers.sort_unstable();
                numbers
            });
            let summary = ctx
                .load_and_preprocess_spectra(
                    VecScanStream::new(make_scans(100)),
                    ScanSelection::SpecificScanRange(40, 60),
                    tx,
                )
                .unwrap();
            assert_eq!(summary.queries, 21);
            assert_eq!(consumer.join().unwrap(), (40..=60).collect::<Vec<_>>());
        });
        Ok(())
    }

    #[test]
    fn test_inverted_selection_is_fatal() {
        let ctx = PreprocessingContext::new(make_params()).unwrap();
        let (tx, _rx) = ctx.query_channel();
        let result = ctx.load_and_preprocess_spectra(
            VecScanStream::new(make_scans(10)),
            ScanSelection::SpecificScanRange(50, 10),
            tx,
        );
        assert!(matches!(
            result,
            Err(PreprocessError::Params(ParamsError::ScanRangeInverted(50, 10)))
        ));
    }

    #[test_log::test]
    fn test_consumer_hangup_winds_down() -> Result<(), PreprocessError> {
        let mut params = make_params();
        params.spectrum_batch_size = 2;
        let ctx = PreprocessingContext::new(params)?;
        let (tx, rx) = ctx.query_channel();
        drop(rx);
        let summary = ctx.load_and_preprocess_spectra(
            VecScanStream::new(make_scans(50)),
            ScanSelection::EntireFile,
            tx,
        )?;
        assert!(ctx.aborted());
        assert!(summary.queries < 50);
        assert_eq!(ctx.pool().in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_reset_allows_reuse_across_files() -> Result<(), PreprocessError> {
        let ctx = PreprocessingContext::new(make_params())?;
        for _ in 0..2 {
            ctx.reset();
            let (tx, rx) = ctx.query_channel();
            let summary = thread::scope(|s| {
                let consumer = s.spawn(move || rx.iter().count());
                let summary = ctx
                    .load_and_preprocess_spectra(
                        VecScanStream::new(make_scans(20)),
                        ScanSelection::EntireFile,
                        tx,
                    )
                    .unwrap();
                assert_eq!(consumer.join().unwrap(), 20);
                summary
            });
            assert_eq!(summary.queries, 20);
            assert!(ctx.done_processing_all_spectra());
        }
        Ok(())
    }

    #[test]
    fn test_wait_until_done() -> Result<(), PreprocessError> {
        let ctx = PreprocessingContext::new(make_params())?;
        let (tx, rx) = ctx.query_channel();
        thread::scope(|s| {
            s.spawn(|| {
                let _count = rx.iter().count();
            });
            ctx.load_and_preprocess_spectra(
                VecScanStream::new(make_scans(30)),
                ScanSelection::EntireFile,
                tx,
            )
            .unwrap();
            ctx.wait_until_done();
            assert!(ctx.done_processing_all_spectra());
        });
        Ok(())
    }

    #[test]
    fn test_skips_are_counted_not_fatal() -> Result<(), PreprocessError> {
        let mut scans = make_scans(10);
        scans[2].peaks.truncate(1);
        scans[5].precursor_charge = Some(2);
        scans[5].precursor_mz = 2500.0;
        let ctx = PreprocessingContext::new(make_params())?;
        let (tx, rx) = ctx.query_channel();
        let summary = thread::scope(|s| {
            let consumer = s.spawn(move || rx.iter().count());
            let summary = ctx
                .load_and_preprocess_spectra(
                    VecScanStream::new(scans),
                    ScanSelection::EntireFile,
                    tx,
                )
                .unwrap();
            assert_eq!(consumer.join().unwrap(), 8);
            summary
        });
        assert_eq!(summary.queries, 8);
        assert_eq!(summary.skipped_too_few_peaks, 1);
        assert_eq!(summary.skipped_mass_out_of_range, 1);
        Ok(())
    }
}
