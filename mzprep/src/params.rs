//! The resolved parameter set controlling preprocessing.
//!
//! [`SearchParams`] is the flattened, validated form of whatever
//! configuration surface sits above it. The library never reads a
//! parameter file itself; callers resolve one and hand it in.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mass of a proton in Daltons
pub const PROTON: f64 = 1.00727646688;

/// Hard cap on the number of preprocessing workers
pub const MAX_WORKER_THREADS: usize = 128;

/// How a spectrum's precursor ion was fragmented
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationMethod {
    #[default]
    Unknown,
    CID,
    HCD,
    ETD,
    #[serde(rename = "ETD+SA")]
    EThcD,
    ECD,
    PQD,
    IRMPD,
    SID,
}

impl Display for ActivationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EThcD => write!(f, "ETD+SA"),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Restrict processing to spectra acquired with a particular activation
/// method, or accept them all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationFilter {
    #[default]
    #[serde(rename = "ALL")]
    All,
    #[serde(untagged)]
    Only(ActivationMethod),
}

impl ActivationFilter {
    /// Does `method` pass this filter? Spectra whose activation could not
    /// be determined always pass, matching the reference behavior of only
    /// filtering on positively identified mismatches.
    pub fn accepts(&self, method: ActivationMethod) -> bool {
        match self {
            Self::All => true,
            Self::Only(want) => method == ActivationMethod::Unknown || method == *want,
        }
    }
}

impl Display for ActivationFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Only(method) => write!(f, "{method}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unrecognized activation method {0:?}")]
pub struct ActivationFilterParseError(String);

impl FromStr for ActivationFilter {
    type Err = ActivationFilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let filter = match s.to_ascii_uppercase().as_str() {
            "ALL" => Self::All,
            "CID" => Self::Only(ActivationMethod::CID),
            "HCD" => Self::Only(ActivationMethod::HCD),
            "ETD" => Self::Only(ActivationMethod::ETD),
            "ETD+SA" | "ETHCD" => Self::Only(ActivationMethod::EThcD),
            "ECD" => Self::Only(ActivationMethod::ECD),
            "PQD" => Self::Only(ActivationMethod::PQD),
            "IRMPD" => Self::Only(ActivationMethod::IRMPD),
            "SID" => Self::Only(ActivationMethod::SID),
            _ => return Err(ActivationFilterParseError(s.to_string())),
        };
        Ok(filter)
    }
}

/// What to do about peaks near the precursor m/z
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecursorRemoval {
    /// Leave the precursor region alone
    #[default]
    None,
    /// Remove peaks within the tolerance window around the precursor m/z
    /// for every spectrum
    All,
    /// Remove the precursor window only for spectra acquired with
    /// electron-transfer style activation (ETD, ETD+SA, ECD)
    ChargeReducedOnly,
}

impl PrecursorRemoval {
    pub fn applies_to(&self, method: ActivationMethod) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::ChargeReducedOnly => matches!(
                method,
                ActivationMethod::ETD | ActivationMethod::EThcD | ActivationMethod::ECD
            ),
        }
    }
}

/// How theoretical fragments will be binned during scoring, which decides
/// whether flanking bins receive half-height contributions here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentIonMode {
    /// Flanking bins share the signal, stair-stepping the processed array
    #[default]
    Flanking,
    /// Each fragment occupies a single bin
    SingleBin,
}

/// How to treat the charge state reported by the instrument
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargePolicy {
    /// Use the reported charge when present, fall back to the intensity
    /// heuristic when absent
    #[default]
    UseReported,
    /// Ignore the reported charge and always apply the heuristic
    Ignore,
}

/// Every knob the preprocessing pipeline reads, flattened and resolved.
///
/// The defaults reproduce the reference parameter template, so a
/// `SearchParams::default()` run behaves like an untouched parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// First and last scan to process; `(0, 0)` means the entire file
    pub scan_range: (u32, u32),
    /// MS level of spectra to process
    pub ms_level: u8,
    /// Activation method filter
    pub activation_method: ActivationFilter,
    /// Spectra with fewer peaks than this are skipped
    pub minimum_peaks: usize,
    /// Peaks below this absolute intensity are discarded at load
    pub minimum_intensity: f64,
    /// Discard binned peaks below this fraction of the base peak,
    /// expressed as a percentage (0 disables)
    pub percentage_base_peak: f64,
    /// Precursor peak removal mode
    pub remove_precursor_peak: PrecursorRemoval,
    /// Half-width in Th of the precursor removal window
    pub remove_precursor_tolerance: f64,
    /// Zero out this m/z window in every spectrum; `(0.0, 0.0)` disables
    pub clear_mz_range: (f64, f64),
    /// Fragment bin width in Th
    pub fragment_bin_tol: f64,
    /// Fractional offset applied when assigning an m/z to a bin
    pub fragment_bin_offset: f64,
    /// Flanking-bin behavior of the eventual scoring stage
    pub theoretical_fragment_ions: FragmentIonMode,
    /// Whether to trust reported precursor charges
    pub override_charge: ChargePolicy,
    /// Acceptable precursor charge range; `(0, 0)` disables the check
    pub precursor_charge: (i32, i32),
    /// Acceptable protonated precursor mass range in Daltons
    pub digest_mass_range: (f64, f64),
    /// Worker thread count; 0 selects the available parallelism
    pub num_threads: usize,
    /// Bound on the number of preprocessed queries buffered ahead of the
    /// consumer
    pub spectrum_batch_size: usize,
    /// Half-width in bins of the sliding background window used by the
    /// fast cross-correlation transform
    pub xcorr_processing_offset: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            scan_range: (0, 0),
            ms_level: 2,
            activation_method: ActivationFilter::default(),
            minimum_peaks: 10,
            minimum_intensity: 0.0,
            percentage_base_peak: 0.0,
            remove_precursor_peak: PrecursorRemoval::default(),
            remove_precursor_tolerance: 1.5,
            clear_mz_range: (0.0, 0.0),
            fragment_bin_tol: 0.02,
            fragment_bin_offset: 0.0,
            theoretical_fragment_ions: FragmentIonMode::default(),
            override_charge: ChargePolicy::default(),
            precursor_charge: (0, 0),
            digest_mass_range: (600.0, 5000.0),
            num_threads: 0,
            spectrum_batch_size: 15000,
            xcorr_processing_offset: 75,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("The scan range {0}-{1} ends before it starts")]
    ScanRangeInverted(u32, u32),
    #[error("The fragment bin width must be positive, got {0}")]
    NonPositiveBinWidth(f64),
    #[error("The fragment bin offset must be in [0, 1), got {0}")]
    BinOffsetOutOfRange(f64),
    #[error("The digest mass range {0}-{1} ends before it starts")]
    DigestMassRangeInverted(f64, f64),
    #[error("The precursor charge range {0}-{1} ends before it starts")]
    PrecursorChargeRangeInverted(i32, i32),
    #[error("The spectrum batch size must be at least 1")]
    ZeroBatchSize,
}

impl SearchParams {
    /// Reject contradictory settings up front, before any threads are
    /// spawned or buffers allocated.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let (first, last) = self.scan_range;
        if last != 0 && first > last {
            return Err(ParamsError::ScanRangeInverted(first, last));
        }
        if self.fragment_bin_tol <= 0.0 {
            return Err(ParamsError::NonPositiveBinWidth(self.fragment_bin_tol));
        }
        if !(0.0..1.0).contains(&self.fragment_bin_offset) {
            return Err(ParamsError::BinOffsetOutOfRange(self.fragment_bin_offset));
        }
        let (low, high) = self.digest_mass_range;
        if low > high {
            return Err(ParamsError::DigestMassRangeInverted(low, high));
        }
        let (zlow, zhigh) = self.precursor_charge;
        if (zlow, zhigh) != (0, 0) && zlow > zhigh {
            return Err(ParamsError::PrecursorChargeRangeInverted(zlow, zhigh));
        }
        if self.spectrum_batch_size == 0 {
            return Err(ParamsError::ZeroBatchSize);
        }
        Ok(())
    }

    pub fn inverse_bin_width(&self) -> f64 {
        1.0 / self.fragment_bin_tol
    }

    pub fn one_minus_bin_offset(&self) -> f64 {
        1.0 - self.fragment_bin_offset
    }

    /// Map an m/z (or mass) to its fragment bin index
    pub fn bin(&self, mass: f64) -> usize {
        (mass * self.inverse_bin_width() + self.one_minus_bin_offset()) as usize
    }

    /// Number of bins a spectrum with protonated precursor mass
    /// `pep_mass` needs, with the cushion the scoring stage expects
    pub fn array_size_for(&self, pep_mass: f64) -> usize {
        self.bin(pep_mass + self.fragment_bin_tol + 2.0)
    }

    /// Largest per-buffer bin count any acceptable precursor can demand
    pub fn bin_capacity(&self) -> usize {
        self.array_size_for(self.digest_mass_range.1) + 1
    }

    /// Resolve `num_threads` to a concrete worker count
    pub fn worker_count(&self) -> usize {
        let requested = if self.num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.num_threads
        };
        requested.clamp(1, MAX_WORKER_THREADS)
    }

    /// Is `charge` acceptable under the configured precursor charge range?
    pub fn charge_in_range(&self, charge: i32) -> bool {
        let (low, high) = self.precursor_charge;
        (low, high) == (0, 0) || (low..=high).contains(&charge)
    }
}

/// Protonated mass (MH+) for an ion observed at `mz` with charge `z`
pub fn protonated_mass(mz: f64, z: i32) -> f64 {
    let z = z as f64;
    mz * z - (z - 1.0) * PROTON
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let params = SearchParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.ms_level, 2);
        assert_eq!(params.minimum_peaks, 10);
        assert_eq!(params.spectrum_batch_size, 15000);
    }

    #[test]
    fn test_validate_rejects_inverted_ranges() {
        let mut params = SearchParams::default();
        params.scan_range = (500, 100);
        assert_eq!(params.validate(), Err(ParamsError::ScanRangeInverted(500, 100)));

        let mut params = SearchParams::default();
        params.digest_mass_range = (5000.0, 600.0);
        assert!(matches!(
            params.validate(),
            Err(ParamsError::DigestMassRangeInverted(_, _))
        ));

        let mut params = SearchParams::default();
        params.fragment_bin_tol = 0.0;
        assert!(matches!(
            params.validate(),
            Err(ParamsError::NonPositiveBinWidth(_))
        ));
    }

    #[test]
    fn test_binning() {
        let params = SearchParams::default();
        // 0.02 Th bins, offset 0.0
        assert_eq!(params.bin(0.0), 1);
        assert_eq!(params.bin(200.0), 10001);
        let mut shifted = SearchParams::default();
        shifted.fragment_bin_tol = 1.0005079;
        shifted.fragment_bin_offset = 0.4;
        assert_eq!(shifted.bin(147.11334), 147);
    }

    #[test]
    fn test_protonated_mass() {
        let m = protonated_mass(500.0, 2);
        assert!((m - (1000.0 - PROTON)).abs() < 1e-9);
        // Singly charged ions are already MH+
        assert!((protonated_mass(500.0, 1) - 500.0).abs() < 1e-12);
    }

    #[test]
    fn test_activation_filter_fromstr() -> Result<(), ActivationFilterParseError> {
        let f: ActivationFilter = "ALL".parse()?;
        assert_eq!(f, ActivationFilter::All);
        let f: ActivationFilter = "hcd".parse()?;
        assert_eq!(f, ActivationFilter::Only(ActivationMethod::HCD));
        let f: ActivationFilter = "ETD+SA".parse()?;
        assert_eq!(f, ActivationFilter::Only(ActivationMethod::EThcD));
        assert!("XYZ".parse::<ActivationFilter>().is_err());
        Ok(())
    }

    #[test]
    fn test_activation_filter_accepts_unknown() {
        let f = ActivationFilter::Only(ActivationMethod::HCD);
        assert!(f.accepts(ActivationMethod::HCD));
        assert!(f.accepts(ActivationMethod::Unknown));
        assert!(!f.accepts(ActivationMethod::CID));
    }

    #[test]
    fn test_charge_range() {
        let mut params = SearchParams::default();
        assert!(params.charge_in_range(7));
        params.precursor_charge = (2, 4);
        assert!(params.charge_in_range(3));
        assert!(!params.charge_in_range(1));
    }
}
