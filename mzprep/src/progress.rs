use std::ops::{Add, AddAssign};

use crate::preprocess::SkipReason;

/// Per-run accounting of what the dispatcher did with each spectrum
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub queries: usize,
    pub charges_defaulted: usize,
    pub skipped_too_few_peaks: usize,
    pub skipped_no_precursor: usize,
    pub skipped_empty: usize,
    pub skipped_mass_out_of_range: usize,
    pub skipped_charge_out_of_range: usize,
    pub filtered_ms_level: usize,
    pub filtered_activation: usize,
}

impl RunSummary {
    pub fn tally_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::TooFewPeaks => self.skipped_too_few_peaks += 1,
            SkipReason::NoPrecursor => self.skipped_no_precursor += 1,
            SkipReason::EmptySpectrum => self.skipped_empty += 1,
            SkipReason::MassOutOfRange => self.skipped_mass_out_of_range += 1,
            SkipReason::ChargeOutOfRange => self.skipped_charge_out_of_range += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_too_few_peaks
            + self.skipped_no_precursor
            + self.skipped_empty
            + self.skipped_mass_out_of_range
            + self.skipped_charge_out_of_range
    }
}

impl Add for RunSummary {
    type Output = RunSummary;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self.clone();
        dup += rhs;
        dup
    }
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.queries += rhs.queries;
        self.charges_defaulted += rhs.charges_defaulted;
        self.skipped_too_few_peaks += rhs.skipped_too_few_peaks;
        self.skipped_no_precursor += rhs.skipped_no_precursor;
        self.skipped_empty += rhs.skipped_empty;
        self.skipped_mass_out_of_range += rhs.skipped_mass_out_of_range;
        self.skipped_charge_out_of_range += rhs.skipped_charge_out_of_range;
        self.filtered_ms_level += rhs.filtered_ms_level;
        self.filtered_activation += rhs.filtered_activation;
    }
}
