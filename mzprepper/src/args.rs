use mzprep::dispense::ScanSelection;

/// An input file argument, optionally carrying a scan selection suffix
/// like `run.mzML:1000-1500`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub path: String,
    pub selection: Option<ScanSelection>,
}

/// Split a raw input argument into a path and an optional scan
/// selection. A trailing `:N`, `:F-L`, or `:F+K` names the scans to
/// process; anything that does not parse as one is treated as part of
/// the path.
pub fn parse_input_spec(raw: &str) -> InputSpec {
    if let Some((path, suffix)) = raw.rsplit_once(':') {
        if !path.is_empty() && !suffix.is_empty() {
            if let Ok(selection) = suffix.parse::<ScanSelection>() {
                return InputSpec {
                    path: path.to_string(),
                    selection: Some(selection),
                };
            }
        }
    }
    InputSpec {
        path: raw.to_string(),
        selection: None,
    }
}

/// The commented parameter file template written by `-p`
pub fn default_params_template() -> String {
    r#"# mzprepper parameter file
# Everything below mirrors the built-in defaults. Uncommented values are
# read as-is; comment a line out to fall back to the default.
# Environment variables prefixed with MZPREPPER_ override this file.

[params]
# First and last scan to preprocess; [0, 0] means the entire file
scan_range = [0, 0]
# MS level of the spectra to preprocess
ms_level = 2
# One of ALL, CID, ECD, ETD, ETD+SA, PQD, HCD, IRMPD, SID
activation_method = "ALL"
# Spectra with fewer peaks than this produce no query
minimum_peaks = 10
# Discard peaks below this absolute intensity at load
minimum_intensity = 0.0
# Discard binned peaks below this percentage of the base peak; 0 disables
percentage_base_peak = 0.0
# One of none, all, charge_reduced_only
remove_precursor_peak = "none"
# Half-width in Th of the precursor removal window
remove_precursor_tolerance = 1.5
# Zero out this m/z window in every spectrum; [0.0, 0.0] disables
clear_mz_range = [0.0, 0.0]
# Fragment bin width in Th
fragment_bin_tol = 0.02
# Fractional bin offset in [0, 1)
fragment_bin_offset = 0.0
# One of flanking, single_bin
theoretical_fragment_ions = "flanking"
# One of use_reported, ignore
override_charge = "use_reported"
# Acceptable precursor charge range; [0, 0] disables the check
precursor_charge = [0, 0]
# Acceptable protonated precursor mass range in Daltons
digest_mass_range = [600.0, 5000.0]
# Worker threads; 0 uses all available cores
num_threads = 0
# Cap on finished queries buffered ahead of the consumer
spectrum_batch_size = 15000
# Half-width in bins of the cross-correlation background window
xcorr_processing_offset = 75
"#
    .to_string()
}
