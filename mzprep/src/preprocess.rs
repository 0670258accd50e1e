//! The per-spectrum preprocessing pipeline.
//!
//! Everything here is a pure transformation from a [`RawScan`] plus a
//! scratch [`BufferSet`] to a [`PreprocessedQuery`]. Spectra that fail a
//! quality gate are reported as counted skips, never as errors, so one
//! bad scan cannot take down a run.

use serde::{Deserialize, Serialize};

use crate::params::{
    protonated_mass, ChargePolicy, FragmentIonMode, PrecursorRemoval, SearchParams, PROTON,
};
use crate::pool::BufferSet;
use crate::scan::RawScan;

/// Number of normalization regions the binned spectrum is divided into
pub const NUM_REGIONS: usize = 10;
/// Value the most intense bin of each region is scaled to
pub const REGION_CEILING: f64 = 50.0;
/// Fraction of the base peak below which bins are treated as noise
pub const NOISE_FLOOR_FRACTION: f64 = 0.05;

/// Why a spectrum produced no query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Fewer peaks than `minimum_peaks`
    TooFewPeaks,
    /// No precursor ion recorded on an MSn scan
    NoPrecursor,
    /// Nothing survived the intensity filters
    EmptySpectrum,
    /// Protonated precursor mass outside the digest mass range
    MassOutOfRange,
    /// Reported precursor charge outside the accepted range
    ChargeOutOfRange,
}

/// The result of one preprocessing dispatch
#[derive(Debug)]
pub enum Outcome {
    Preprocessed(Box<PreprocessedQuery>),
    Skipped(SkipReason),
}

/// A spectrum ready for fast cross-correlation scoring
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedQuery {
    pub scan_number: u32,
    /// The charge state the query assumes
    pub charge: i32,
    /// Whether `charge` came from the heuristic rather than the file
    pub charge_defaulted: bool,
    /// Protonated precursor mass (MH+) in Daltons
    pub pep_mass: f64,
    /// Most intense surviving peak, in the square-root domain
    pub base_peak_intensity: f64,
    /// Summed surviving intensity, in the square-root domain
    pub total_intensity: f64,
    /// Number of fragment bins this query spans
    pub bin_count: usize,
    /// Highest populated bin
    pub highest_bin: usize,
    /// The fast cross-correlation array the scorer dot-products against
    pub xcorr_data: Vec<f32>,
    /// Peak-extracted, normalized intensities for preliminary scoring
    pub peak_data: Vec<f32>,
}

struct LoadStats {
    base_peak: f64,
    total: f64,
    highest_bin: usize,
}

/// Runs the full pipeline for one spectrum at a time. Cheap to build,
/// one per worker.
pub struct Preprocessor<'a> {
    params: &'a SearchParams,
}

impl<'a> Preprocessor<'a> {
    pub fn new(params: &'a SearchParams) -> Self {
        Self { params }
    }

    /// Preprocess one scan in `buffers`, which must span at least
    /// `params.bin_capacity()` bins.
    pub fn preprocess(&self, scan: &RawScan, buffers: &mut BufferSet) -> Outcome {
        let params = self.params;

        if scan.peaks.len() < params.minimum_peaks {
            return Outcome::Skipped(SkipReason::TooFewPeaks);
        }
        if scan.precursor_mz <= 0.0 {
            return Outcome::Skipped(SkipReason::NoPrecursor);
        }

        let (charge, charge_defaulted) = match self.resolve_charge(scan) {
            Ok(z) => z,
            Err(reason) => return Outcome::Skipped(reason),
        };

        let pep_mass = protonated_mass(scan.precursor_mz, charge);
        let (mass_low, mass_high) = params.digest_mass_range;
        if !(mass_low..=mass_high).contains(&pep_mass) {
            return Outcome::Skipped(SkipReason::MassOutOfRange);
        }

        let array_size = params.array_size_for(pep_mass).min(buffers.bin_capacity());

        buffers.clear();
        let stats = self.load_ions(scan, charge, pep_mass, array_size, &mut buffers.raw);
        if stats.total <= 0.0 || stats.base_peak <= 0.0 {
            return Outcome::Skipped(SkipReason::EmptySpectrum);
        }

        normalize_regions(
            &buffers.raw[..array_size],
            &mut buffers.corr[..array_size],
            stats.highest_bin,
            stats.base_peak,
        );
        smooth(&buffers.corr[..array_size], &mut buffers.smoothed[..array_size]);
        extract_peaks(
            &buffers.corr[..array_size],
            &buffers.smoothed[..array_size],
            &mut buffers.extracted[..array_size],
        );

        // The raw array is done, reuse it for the sliding means
        let xcorr_data = fast_xcorr(
            &buffers.extracted[..array_size],
            &mut buffers.raw[..array_size],
            params.xcorr_processing_offset,
            params.theoretical_fragment_ions == FragmentIonMode::Flanking,
        );
        let peak_data = buffers.extracted[..array_size]
            .iter()
            .map(|v| *v as f32)
            .collect();

        Outcome::Preprocessed(Box::new(PreprocessedQuery {
            scan_number: scan.scan_number,
            charge,
            charge_defaulted,
            pep_mass,
            base_peak_intensity: stats.base_peak,
            total_intensity: stats.total,
            bin_count: array_size,
            highest_bin: stats.highest_bin,
            xcorr_data,
            peak_data,
        }))
    }

    /// Settle on a charge state. When the file carries none, or the
    /// configuration says to ignore it, fall back on the classic
    /// fraction-of-signal-above-the-precursor test: a spectrum with
    /// nearly all of its signal below the precursor m/z is taken as 1+,
    /// anything else as 2+.
    fn resolve_charge(&self, scan: &RawScan) -> Result<(i32, bool), SkipReason> {
        let params = self.params;
        if params.override_charge == ChargePolicy::UseReported {
            if let Some(z) = scan.precursor_charge {
                if !params.charge_in_range(z) {
                    return Err(SkipReason::ChargeOutOfRange);
                }
                return Ok((z, false));
            }
        }
        let tic = scan.total_ion_current();
        if tic <= 0.0 {
            return Err(SkipReason::EmptySpectrum);
        }
        let above = scan.intensity_above(scan.precursor_mz);
        let z = if above / tic < NOISE_FLOOR_FRACTION { 1 } else { 2 };
        if !params.charge_in_range(z) {
            return Err(SkipReason::ChargeOutOfRange);
        }
        Ok((z, true))
    }

    /// Bin the peak list into `raw`, applying the square root transform,
    /// the intensity floors, the clear-m/z window, and precursor removal.
    /// Bin collisions keep the larger value.
    fn load_ions(
        &self,
        scan: &RawScan,
        charge: i32,
        pep_mass: f64,
        array_size: usize,
        raw: &mut [f64],
    ) -> LoadStats {
        let params = self.params;
        let (clear_low, clear_high) = params.clear_mz_range;
        let clearing = clear_high > clear_low;

        let mut removal_windows: Vec<f64> = Vec::new();
        if params.remove_precursor_peak.applies_to(scan.activation) {
            removal_windows.push(scan.precursor_mz);
            if params.remove_precursor_peak == PrecursorRemoval::ChargeReducedOnly {
                // Charge-reduced precursor species shed one proton at a time
                for z in 1..charge {
                    removal_windows.push((pep_mass + (z as f64 - 1.0) * PROTON) / z as f64);
                }
            }
        }

        let mut stats = LoadStats {
            base_peak: 0.0,
            total: 0.0,
            highest_bin: 0,
        };

        for (mz, intensity) in scan.peaks.iter().copied() {
            let intensity = intensity as f64;
            if intensity <= 0.0 || intensity < params.minimum_intensity {
                continue;
            }
            if clearing && (clear_low..=clear_high).contains(&mz) {
                continue;
            }
            if removal_windows
                .iter()
                .any(|center| (mz - center).abs() <= params.remove_precursor_tolerance)
            {
                continue;
            }
            let bin = params.bin(mz);
            if bin >= array_size {
                continue;
            }
            let value = intensity.sqrt();
            if value > raw[bin] {
                stats.total += value - raw[bin];
                raw[bin] = value;
                if value > stats.base_peak {
                    stats.base_peak = value;
                }
                if bin > stats.highest_bin {
                    stats.highest_bin = bin;
                }
            }
        }

        if params.percentage_base_peak > 0.0 && stats.base_peak > 0.0 {
            let floor = stats.base_peak * params.percentage_base_peak / 100.0;
            for value in raw[..array_size].iter_mut() {
                if *value > 0.0 && *value < floor {
                    stats.total -= *value;
                    *value = 0.0;
                }
            }
        }

        stats
    }
}

/// Scale each of the [`NUM_REGIONS`] regions so its most intense bin
/// sits exactly at [`REGION_CEILING`], dropping bins under the global
/// noise floor.
fn normalize_regions(raw: &[f64], corr: &mut [f64], highest_bin: usize, base_peak: f64) {
    let region_size = highest_bin / NUM_REGIONS + 1;
    let noise_floor = base_peak * NOISE_FLOOR_FRACTION;

    for region in 0..NUM_REGIONS {
        let start = region * region_size;
        if start >= raw.len() {
            break;
        }
        let end = ((region + 1) * region_size).min(raw.len());
        let region_max = raw[start..end]
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(*v));
        if region_max <= 0.0 {
            continue;
        }
        let scale = REGION_CEILING / region_max;
        for (r, c) in raw[start..end].iter().zip(corr[start..end].iter_mut()) {
            if *r > noise_floor {
                *c = *r * scale;
            }
        }
    }
}

/// Five point binomial smoothing (1 4 6 4 1), truncated and renormalized
/// at the array edges so boundary bins are not biased toward zero
fn smooth(corr: &[f64], smoothed: &mut [f64]) {
    const WEIGHTS: [f64; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
    let n = corr.len();
    for i in 0..n {
        let mut acc = 0.0;
        let mut weight = 0.0;
        for (k, w) in WEIGHTS.iter().enumerate() {
            let j = i as isize + k as isize - 2;
            if (0..n as isize).contains(&j) {
                acc += w * corr[j as usize];
                weight += w;
            }
        }
        smoothed[i] = acc / weight;
    }
}

/// Keep only bins that are local maxima of the smoothed signal, judged
/// by the discrete second difference, writing the normalized (not
/// smoothed) magnitude at each accepted position
fn extract_peaks(corr: &[f64], smoothed: &[f64], extracted: &mut [f64]) {
    let n = corr.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        extracted[0] = corr[0];
        return;
    }
    for i in 0..n {
        let is_peak = if i == 0 {
            smoothed[0] > smoothed[1]
        } else if i == n - 1 {
            smoothed[n - 1] > smoothed[n - 2]
        } else {
            let rising = smoothed[i] > smoothed[i - 1];
            let falling = smoothed[i] >= smoothed[i + 1];
            let curvature = smoothed[i - 1] - 2.0 * smoothed[i] + smoothed[i + 1];
            rising && falling && curvature < 0.0
        };
        if is_peak && corr[i] > 0.0 {
            extracted[i] = corr[i];
        }
    }
}

/// Subtract the sliding-window background from every bin: each output is
/// the input minus the mean of the surrounding `offset` bins on either
/// side, the bin itself excluded. In flanking mode each bin also picks
/// up half of its neighbors' backgrounds-subtracted values.
fn fast_xcorr(extracted: &[f64], means: &mut [f64], offset: usize, flanking: bool) -> Vec<f32> {
    let n = extracted.len();
    if n == 0 {
        return Vec::new();
    }
    let window = 2 * offset + 1;
    let scale = if window > 1 {
        1.0 / (window - 1) as f64
    } else {
        0.0
    };

    let mut sum: f64 = extracted[..=offset.min(n - 1)].iter().sum();
    for i in 0..n {
        means[i] = (sum - extracted[i]) * scale;
        let incoming = i + offset + 1;
        if incoming < n {
            sum += extracted[incoming];
        }
        if i >= offset {
            sum -= extracted[i - offset];
        }
    }

    (0..n)
        .map(|i| {
            let mut value = extracted[i] - means[i];
            if flanking {
                if i > 0 {
                    value += 0.5 * (extracted[i - 1] - means[i - 1]);
                }
                if i + 1 < n {
                    value += 0.5 * (extracted[i + 1] - means[i + 1]);
                }
            }
            value as f32
        })
        .collect()
}
