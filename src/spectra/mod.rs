//! # APOGEE spectra
//!
//! Containers for raw and continuum-normalized spectra, plus the
//! [`ChipLayout`] that maps a shared wavelength grid onto the detector
//! chips.
//!
//! All stars from one instrument configuration share a single ascending
//! wavelength grid; per-star data are flux, flux error and an integer
//! quality mask, one value per grid pixel. Flux may be non-finite — that is
//! how upstream marks a bad pixel, not an error condition.

pub mod normalize;

use crate::constants::{Angstrom, CHIPS};
use crate::parallax_errors::ParallaxError;

/// One star's raw spectrum on the shared wavelength grid.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub flux: Vec<f64>,
    pub error: Vec<f64>,
    /// Instrument quality bitmask, carried through normalization untouched.
    pub mask: Vec<i32>,
}

impl Spectrum {
    pub fn new(flux: Vec<f64>, error: Vec<f64>, mask: Vec<i32>) -> Result<Self, ParallaxError> {
        if flux.len() != error.len() || flux.len() != mask.len() {
            return Err(ParallaxError::ShapeMismatch(format!(
                "spectrum columns disagree: flux {}, error {}, mask {}",
                flux.len(),
                error.len(),
                mask.len()
            )));
        }
        Ok(Spectrum { flux, error, mask })
    }

    pub fn len(&self) -> usize {
        self.flux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flux.is_empty()
    }
}

/// One star's continuum-normalized spectrum.
///
/// Only in-chip pixels survive (see [`ChipLayout::kept`]); flux is
/// continuum-relative (≈ 1 for uncontaminated pixels) and error is rescaled
/// by the same fitted continuum.
#[derive(Debug, Clone)]
pub struct NormalizedSpectrum {
    pub flux: Vec<f64>,
    pub error: Vec<f64>,
    pub mask: Vec<i32>,
}

/// Precomputed mapping from a wavelength grid to detector chips.
///
/// Built once per batch and shared by every star: which grid pixels fall in
/// each chip (strict bounds, chips in catalog order) and which pixels are
/// kept in the output (the union of all chips, in grid order).
#[derive(Debug, Clone)]
pub struct ChipLayout {
    wavelengths: Vec<Angstrom>,
    /// Per-chip `(name, pixel indices)`, in chip order.
    chip_pixels: Vec<(&'static str, Vec<usize>)>,
    /// Indices of pixels inside at least one chip, ascending.
    kept: Vec<usize>,
}

impl ChipLayout {
    /// Lay the standard APOGEE chips over `wavelengths`.
    pub fn new(wavelengths: Vec<Angstrom>) -> Self {
        Self::with_chips(wavelengths, &CHIPS)
    }

    /// Lay an arbitrary chip set over `wavelengths`. Bounds are exclusive.
    pub fn with_chips(
        wavelengths: Vec<Angstrom>,
        chips: &[(&'static str, Angstrom, Angstrom)],
    ) -> Self {
        let chip_pixels: Vec<(&'static str, Vec<usize>)> = chips
            .iter()
            .map(|&(name, lo, hi)| {
                let pixels = wavelengths
                    .iter()
                    .enumerate()
                    .filter(|(_, &w)| lo < w && w < hi)
                    .map(|(i, _)| i)
                    .collect();
                (name, pixels)
            })
            .collect();

        let mut in_chip = vec![false; wavelengths.len()];
        for (_, pixels) in &chip_pixels {
            for &i in pixels {
                in_chip[i] = true;
            }
        }
        let kept = in_chip
            .iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(i, _)| i)
            .collect();

        ChipLayout {
            wavelengths,
            chip_pixels,
            kept,
        }
    }

    /// Full input wavelength grid.
    pub fn wavelengths(&self) -> &[Angstrom] {
        &self.wavelengths
    }

    /// Number of pixels in the input grid.
    pub fn n_pixels(&self) -> usize {
        self.wavelengths.len()
    }

    /// Indices of the pixels that survive normalization.
    pub fn kept(&self) -> &[usize] {
        &self.kept
    }

    /// Wavelengths of the surviving pixels, in grid order.
    pub fn kept_wavelengths(&self) -> Vec<Angstrom> {
        self.kept.iter().map(|&i| self.wavelengths[i]).collect()
    }

    pub(crate) fn chip_pixels(&self) -> &[(&'static str, Vec<usize>)] {
        &self.chip_pixels
    }
}
