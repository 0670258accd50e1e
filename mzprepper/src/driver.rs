use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};

use thiserror::Error;

use tracing::{debug, info, warn};

use crossbeam_channel::Receiver;

use mzdata::io::{
    infer_format, infer_from_stream,
    mgf::MGFReaderType,
    mzml::MzMLReaderType,
    MassSpectrometryFormat, PreBufferedStream, RestartableGzDecoder, StreamingSpectrumIterator,
};
use mzdata::prelude::*;

use mzprep::dispatch::{PreprocessError, PreprocessingContext};
use mzprep::dispense::ScanSelection;
use mzprep::params::{ActivationFilter, SearchParams};
use mzprep::preprocess::PreprocessedQuery;
use mzprep::scan::{MzScanStream, SpectrumType};

use crate::args::{default_params_template, parse_input_spec, InputSpec};

pub const PARAMS_TEMPLATE_FILE: &str = "mzprepper.toml.new";

#[derive(Debug, Error)]
pub enum MzPrepperError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("The input file format from STDIN was either unknown or not supported ({0:?})")]
    FormatUnknownOrNotSupportedErrorStdIn(MassSpectrometryFormat),
    #[error("Preprocessing failed: {0}")]
    PreprocessError(
        #[source]
        #[from]
        PreprocessError,
    ),
    #[error("Failed to resolve the configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("No input files were given")]
    NoInputFiles,
}

/// Preprocess mass spectrometry files into fast cross-correlation search
/// queries.
///
/// Read one or more files or a stream, run every selected MSn spectrum
/// through binning, normalization, and background subtraction, and
/// report what a search engine would have been handed.
#[derive(Parser, Debug, Default, Deserialize, Serialize)]
#[command(author, version)]
#[serde(default)]
pub struct MzPrepper {
    /// The paths to read input spectra from, or '-' to read from STDIN.
    ///
    /// A path may carry a scan selection suffix: `run.mzML:1500` for one
    /// scan, `run.mzML:1000-1500` for a range, `run.mzML:1000+50` for a
    /// span of 50 scans after scan 1000.
    #[arg()]
    pub input_files: Vec<String>,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML parameter file to read in addition to `mzprepper.toml` in
    /// the working directory.
    ///
    /// Environment variables prefixed with `MZPREPPER_` will be read too.
    #[arg(short = 'P', long = "params-file")]
    pub params_file: Option<PathBuf>,

    /// Write a commented parameter file template to `mzprepper.toml.new`
    /// and exit
    #[arg(short = 'p', long = "print-params")]
    pub print_params: bool,

    /// The first scan to preprocess, overriding the parameter file
    #[arg(short = 'F', long = "first-scan")]
    pub first_scan: Option<u32>,

    /// The last scan to preprocess, overriding the parameter file
    #[arg(short = 'L', long = "last-scan")]
    pub last_scan: Option<u32>,

    /// The number of spectra to queue ahead of the consumer, overriding
    /// the parameter file
    #[arg(short = 'B', long = "batch-size")]
    pub batch_size: Option<usize>,

    /// The number of worker threads to use, overriding the parameter
    /// file; 0 uses all available cores
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Only preprocess spectra acquired with this activation method
    #[arg(
        short = 'a',
        long = "activation",
        value_parser = ActivationFilter::from_str,
        value_name = "METHOD"
    )]
    pub activation: Option<ActivationFilter>,

    #[arg(skip)]
    pub params: SearchParams,
}

/// What the consumer saw, in place of the scoring engine that would
/// normally sit on the other end of the query channel
#[derive(Debug, Clone, Copy)]
struct QueryStats {
    queries: usize,
    lowest_mass: f64,
    highest_mass: f64,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self {
            queries: 0,
            lowest_mass: f64::INFINITY,
            highest_mass: 0.0,
        }
    }
}

fn consume_queries(receiver: Receiver<Box<PreprocessedQuery>>) -> QueryStats {
    let mut stats = QueryStats::default();
    for query in receiver.iter() {
        stats.queries += 1;
        stats.lowest_mass = stats.lowest_mass.min(query.pep_mass);
        stats.highest_mass = stats.highest_mass.max(query.pep_mass);
    }
    stats
}

impl MzPrepper {
    /// Fold explicitly given command line values back over the extracted
    /// configuration.
    ///
    /// The figment stack merges the parsed arguments before the file and
    /// environment layers so those can fill in whatever the command line
    /// left unset, which would otherwise let a parameter file shadow
    /// values typed on the command line.
    pub fn apply_cli_overrides(&mut self, cli: MzPrepper) {
        if !cli.input_files.is_empty() {
            self.input_files = cli.input_files;
        }
        if cli.log_file.is_some() {
            self.log_file = cli.log_file;
        }
        if cli.params_file.is_some() {
            self.params_file = cli.params_file;
        }
        self.print_params |= cli.print_params;
        if cli.first_scan.is_some() {
            self.first_scan = cli.first_scan;
        }
        if cli.last_scan.is_some() {
            self.last_scan = cli.last_scan;
        }
        if cli.batch_size.is_some() {
            self.batch_size = cli.batch_size;
        }
        if cli.threads.is_some() {
            self.threads = cli.threads;
        }
        if cli.activation.is_some() {
            self.activation = cli.activation;
        }
    }

    /// The parameter set for this run, with the command line overrides
    /// folded in over whatever the configuration layers resolved
    pub fn resolved_params(&self) -> SearchParams {
        let mut params = self.params.clone();
        if let Some(first) = self.first_scan {
            params.scan_range.0 = first;
        }
        if let Some(last) = self.last_scan {
            params.scan_range.1 = last;
        }
        if let Some(batch) = self.batch_size {
            params.spectrum_batch_size = batch;
        }
        if let Some(threads) = self.threads {
            params.num_threads = threads;
        }
        if let Some(activation) = self.activation {
            params.activation_method = activation;
        }
        params
    }

    pub fn main(&self) -> Result<(), MzPrepperError> {
        info!(
            "mzprepper v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        if self.print_params {
            fs::write(PARAMS_TEMPLATE_FILE, default_params_template())?;
            info!("Wrote parameter file template to {PARAMS_TEMPLATE_FILE}");
            return Ok(());
        }
        if self.input_files.is_empty() {
            return Err(MzPrepperError::NoInputFiles);
        }

        let params = self.resolved_params();
        let ctx = PreprocessingContext::new(params)?;
        debug!("Using {} workers", ctx.worker_count());

        for raw in self.input_files.iter() {
            let spec = parse_input_spec(raw);
            info!("Input: {}", spec.path);
            ctx.reset();
            self.reader_then(&ctx, &spec)?;
        }
        Ok(())
    }

    fn reader_then(
        &self,
        ctx: &PreprocessingContext,
        spec: &InputSpec,
    ) -> Result<(), MzPrepperError> {
        let (first, last) = ctx.params().scan_range;
        let selection = spec
            .selection
            .unwrap_or_else(|| ScanSelection::from_scan_range(first, last));
        info!("Selection: {selection}");

        if spec.path == "-" {
            let mut buffered =
                PreBufferedStream::new_with_buffer_size(io::stdin(), 2usize.pow(20))?;
            let (ms_format, compressed) = infer_from_stream(&mut buffered)?;
            debug!("Detected {ms_format:?} from STDIN (compressed? {compressed})");
            match ms_format {
                MassSpectrometryFormat::MGF => {
                    if compressed {
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(
                            RestartableGzDecoder::new(io::BufReader::new(buffered)),
                        ));
                        self.run_workflow(ctx, reader, selection)?;
                    } else {
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(buffered));
                        self.run_workflow(ctx, reader, selection)?;
                    }
                }
                MassSpectrometryFormat::MzML => {
                    if compressed {
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(
                            RestartableGzDecoder::new(io::BufReader::new(buffered)),
                        ));
                        self.run_workflow(ctx, reader, selection)?;
                    } else {
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(buffered));
                        self.run_workflow(ctx, reader, selection)?;
                    }
                }
                _ => {
                    return Err(MzPrepperError::FormatUnknownOrNotSupportedErrorStdIn(
                        ms_format,
                    ))
                }
            }
        } else {
            let (ms_format, compressed) = infer_format(&spec.path)?;
            debug!("Detected {ms_format:?} from path (compressed? {compressed})");
            match ms_format {
                MassSpectrometryFormat::MGF => {
                    if compressed {
                        let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                            &spec.path,
                        )?));
                        let reader = StreamingSpectrumIterator::new(MGFReaderType::new(fh));
                        self.run_workflow(ctx, reader, selection)?;
                    } else {
                        let reader = MGFReaderType::open_path(spec.path.clone())?;
                        self.run_workflow(ctx, reader, selection)?;
                    }
                }
                MassSpectrometryFormat::MzML => {
                    if compressed {
                        let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                            &spec.path,
                        )?));
                        let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(fh));
                        self.run_workflow(ctx, reader, selection)?;
                    } else {
                        let reader = MzMLReaderType::open_path(spec.path.clone())?;
                        self.run_workflow(ctx, reader, selection)?;
                    }
                }
                _ => {
                    return Err(MzPrepperError::FormatUnknownOrNotSupportedError(
                        spec.path.clone(),
                        ms_format,
                    ))
                }
            }
        }
        Ok(())
    }

    fn run_workflow<I>(
        &self,
        ctx: &PreprocessingContext,
        source: I,
        selection: ScanSelection,
    ) -> Result<(), MzPrepperError>
    where
        I: Iterator<Item = SpectrumType> + Send,
    {
        let (send_queries, recv_queries) = ctx.query_channel();

        let start = Instant::now();
        let (summary, stats) = thread::scope(
            |s| -> Result<_, PreprocessError> {
                let consume_task = s.spawn(move || consume_queries(recv_queries));
                let summary = ctx.load_and_preprocess_spectra(
                    MzScanStream::new(source),
                    selection,
                    send_queries,
                )?;
                let stats = match consume_task.join() {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!("Failed to join consumer task: {e:?}");
                        QueryStats::default()
                    }
                };
                Ok((summary, stats))
            },
        )?;
        ctx.wait_until_done();
        let elapsed = Instant::now() - start;

        info!("Queries Produced: {}", summary.queries);
        if stats.queries > 0 {
            info!(
                "Precursor Mass Range: {:0.4}-{:0.4}",
                stats.lowest_mass, stats.highest_mass
            );
        }
        info!(
            "Spectra Skipped: {} | Filtered: {}",
            summary.skipped(),
            summary.filtered_ms_level + summary.filtered_activation
        );
        if summary.skipped() > 0 {
            debug!(
                "Skip reasons: too few peaks={} no precursor={} empty={} mass range={} charge range={}",
                summary.skipped_too_few_peaks,
                summary.skipped_no_precursor,
                summary.skipped_empty,
                summary.skipped_mass_out_of_range,
                summary.skipped_charge_out_of_range,
            );
        }
        info!("Charges Defaulted: {}", summary.charges_defaulted);
        info!("Elapsed Time: {:0.3?}", elapsed);
        Ok(())
    }
}
