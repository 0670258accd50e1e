//! The minimal view of a spectrum the preprocessing pipeline needs, and
//! the seam between it and the file reading machinery.
//!
//! Readers are consumed through [`ScanStream`], so the pipeline never
//! touches format details. The [`MzScanStream`] adapter lifts any
//! iterator of `mzdata` spectra onto that seam.

use mzdata::prelude::*;
use mzdata::spectrum::{MultiLayerSpectrum, RefPeakDataLevel};
use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, DeconvolutedPeak};

use crate::params::ActivationMethod;

pub type SpectrumType = MultiLayerSpectrum<CentroidPeak, DeconvolutedPeak>;

/// An immutable, reader-agnostic spectrum as handed to the pipeline
#[derive(Debug, Default, Clone)]
pub struct RawScan {
    /// The native scan number, or the 1-based spectrum index when the
    /// source format does not carry one
    pub scan_number: u32,
    /// MS level of the scan
    pub ms_level: u8,
    /// Selected ion m/z of the precursor
    pub precursor_mz: f64,
    /// Charge state reported by the instrument, when it reported one
    pub precursor_charge: Option<i32>,
    /// How the precursor was fragmented
    pub activation: ActivationMethod,
    /// Centroided peaks, ordered by m/z
    pub peaks: Vec<(f64, f32)>,
}

impl RawScan {
    /// Summed intensity of peaks above `mz`, used by the charge state
    /// heuristic when the instrument did not report one
    pub fn intensity_above(&self, mz: f64) -> f64 {
        self.peaks
            .iter()
            .filter(|(pmz, _)| *pmz > mz)
            .map(|(_, i)| *i as f64)
            .sum()
    }

    pub fn total_ion_current(&self) -> f64 {
        self.peaks.iter().map(|(_, i)| *i as f64).sum()
    }
}

/// A source of scans in file order. Implementations need not be thread
/// safe; the dispenser serializes access.
pub trait ScanStream {
    fn next_scan(&mut self) -> Option<RawScan>;
}

/// Adapts any iterator of `mzdata` spectra into a [`ScanStream`]
pub struct MzScanStream<I> {
    source: I,
    cursor: u32,
}

impl<I: Iterator<Item = SpectrumType>> MzScanStream<I> {
    pub fn new(source: I) -> Self {
        Self { source, cursor: 0 }
    }
}

impl<I: Iterator<Item = SpectrumType>> ScanStream for MzScanStream<I> {
    fn next_scan(&mut self) -> Option<RawScan> {
        let spectrum = self.source.next()?;
        self.cursor += 1;
        Some(raw_scan_from(&spectrum, self.cursor))
    }
}

/// Pull the native scan number out of an identifier like
/// `controllerType=0 controllerNumber=1 scan=30069`
fn scan_number_from_id(id: &str) -> Option<u32> {
    let start = id.rfind("scan=")? + "scan=".len();
    let digits: String = id[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn activation_method_name(name: &str) -> ActivationMethod {
    let name = name.to_ascii_lowercase();
    if name.contains("ethcd") || name.contains("supplemental") {
        ActivationMethod::EThcD
    } else if name.contains("beam-type") || name.contains("hcd") {
        ActivationMethod::HCD
    } else if name.contains("electron transfer") || name.contains("etd") {
        ActivationMethod::ETD
    } else if name.contains("electron capture") || name.contains("ecd") {
        ActivationMethod::ECD
    } else if name.contains("pulsed q") || name.contains("pqd") {
        ActivationMethod::PQD
    } else if name.contains("infrared") || name.contains("irmpd") {
        ActivationMethod::IRMPD
    } else if name.contains("surface") || name.contains("sid") {
        ActivationMethod::SID
    } else if name.contains("collision-induced") || name.contains("cid") {
        ActivationMethod::CID
    } else {
        ActivationMethod::Unknown
    }
}

/// Project an `mzdata` spectrum down to a [`RawScan`]. Spectra without a
/// usable precursor or peak data come through with empty fields and get
/// skipped downstream rather than erroring here.
pub fn raw_scan_from(spectrum: &SpectrumType, fallback_number: u32) -> RawScan {
    let scan_number = scan_number_from_id(spectrum.id()).unwrap_or(fallback_number);

    let mut scan = RawScan {
        scan_number,
        ms_level: spectrum.ms_level(),
        ..Default::default()
    };

    if let Some(prec) = spectrum.precursor() {
        if let Some(ion) = prec.iter().next() {
            scan.precursor_mz = ion.mz;
            scan.precursor_charge = ion.charge.filter(|z| *z != 0);
        }
        if let Some(method) = prec.activation.method() {
            scan.activation = activation_method_name(method.name());
        }
    }

    scan.peaks = match spectrum.peaks() {
        RefPeakDataLevel::Missing => Vec::new(),
        RefPeakDataLevel::RawData(arrays) => match (arrays.mzs(), arrays.intensities()) {
            (Ok(mzs), Ok(intensities)) => mzs
                .iter()
                .copied()
                .zip(intensities.iter().copied())
                .collect(),
            _ => Vec::new(),
        },
        RefPeakDataLevel::Centroid(peaks) => peaks
            .iter()
            .map(|p| (p.mz(), p.intensity()))
            .collect(),
        RefPeakDataLevel::Deconvoluted(peaks) => {
            let mut pairs: Vec<_> = peaks.iter().map(|p| (p.mz(), p.intensity())).collect();
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            pairs
        }
    };
    scan
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A canned stream for exercising the dispenser and dispatcher
    pub struct VecScanStream {
        scans: std::vec::IntoIter<RawScan>,
    }

    impl VecScanStream {
        pub fn new(scans: Vec<RawScan>) -> Self {
            Self {
                scans: scans.into_iter(),
            }
        }
    }

    impl ScanStream for VecScanStream {
        fn next_scan(&mut self) -> Option<RawScan> {
            self.scans.next()
        }
    }

    pub fn make_scan(scan_number: u32, precursor_mz: f64, peaks: Vec<(f64, f32)>) -> RawScan {
        RawScan {
            scan_number,
            ms_level: 2,
            precursor_mz,
            precursor_charge: Some(2),
            activation: ActivationMethod::HCD,
            peaks,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scan_number_from_id() {
        assert_eq!(
            scan_number_from_id("controllerType=0 controllerNumber=1 scan=30069"),
            Some(30069)
        );
        assert_eq!(scan_number_from_id("scan=12"), Some(12));
        assert_eq!(scan_number_from_id("index=7"), None);
        assert_eq!(scan_number_from_id(""), None);
    }

    #[test]
    fn test_activation_name_mapping() {
        assert_eq!(
            activation_method_name("beam-type collision-induced dissociation"),
            ActivationMethod::HCD
        );
        assert_eq!(
            activation_method_name("collision-induced dissociation"),
            ActivationMethod::CID
        );
        assert_eq!(
            activation_method_name("electron transfer dissociation"),
            ActivationMethod::ETD
        );
        assert_eq!(
            activation_method_name("Electron-Transfer/Higher-Energy Collision Dissociation (EThcD)"),
            ActivationMethod::EThcD
        );
        assert_eq!(activation_method_name("in-source"), ActivationMethod::Unknown);
    }

    #[test]
    fn test_raw_scan_from_mgf_spectrum() {
        use mzdata::io::mgf::MGFReaderType;
        use std::io::Cursor;

        let mgf = "BEGIN IONS\nTITLE=Spectrum_1\nPEPMASS=455.5\nCHARGE=3+\n100.0 10.0\n101.0 5.0\nEND IONS\n";
        let mut reader: MGFReaderType<_, CentroidPeak, DeconvolutedPeak> =
            MGFReaderType::new(Cursor::new(mgf.as_bytes().to_vec()));
        let spectrum = reader.next().unwrap();

        let scan = raw_scan_from(&spectrum, 7);
        assert_eq!(scan.scan_number, 7);
        assert_eq!(scan.ms_level, 2);
        assert!((scan.precursor_mz - 455.5).abs() < 1e-9);
        assert_eq!(scan.precursor_charge, Some(3));
        assert_eq!(scan.activation, ActivationMethod::Unknown);
        assert_eq!(scan.peaks.len(), 2);
        assert!((scan.peaks[0].0 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_intensity_above() {
        let scan = test_support::make_scan(
            1,
            500.0,
            vec![(100.0, 10.0), (400.0, 5.0), (600.0, 2.0), (900.0, 3.0)],
        );
        assert!((scan.intensity_above(500.0) - 5.0).abs() < 1e-9);
        assert!((scan.total_ion_current() - 20.0).abs() < 1e-9);
    }
}
