//! # Design-matrix assembly
//!
//! Merges the photometric catalog and the normalized spectra into the fixed
//! numeric layout the solver consumes. The column layout is an **explicit
//! schema** — an ordered enumeration of feature groups, each with named
//! columns — validated against the incoming data shapes right here, at the
//! boundary, instead of string-keyed table bookkeeping scattered through the
//! pipeline.
//!
//! ## Column order
//! -----------------
//! ```text
//! constant | gaia g/bp/rp | 2MASS j/h/k | WISE w1/w2 | one column per kept spectral pixel
//! ```
//!
//! Spectral columns carry `ln(clamp(flux, 0.01, 1.2))`: the log makes the
//! multiplicative physics additive, and the clamp keeps a handful of
//! pathological pixels from dominating a star's row. Only the spectral
//! columns are L1-penalized — the photometric block is few-dimensional and
//! physically motivated, the spectral block is wide and mostly irrelevant.

use nalgebra::{DMatrix, DVector};

use crate::catalog::Catalog;
use crate::constants::{
    FLUX_CLIP, FLUX_ERR_CLIP, FLUX_TO_MAG_ERR, GAIA_BANDS, PARALLAX_OFFSET, TMASS_BANDS,
    WISE_BANDS,
};
use crate::parallax_errors::ParallaxError;
use crate::spectra::NormalizedSpectrum;

/// The ordered feature groups of the design matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureGroup {
    Constant,
    Gaia,
    Tmass,
    Wise,
    Apogee,
}

impl FeatureGroup {
    pub const ALL: [FeatureGroup; 5] = [
        FeatureGroup::Constant,
        FeatureGroup::Gaia,
        FeatureGroup::Tmass,
        FeatureGroup::Wise,
        FeatureGroup::Apogee,
    ];

    /// Number of columns this group contributes.
    pub fn width(&self, n_pixels: usize) -> usize {
        match self {
            FeatureGroup::Constant => 1,
            FeatureGroup::Gaia => GAIA_BANDS.len(),
            FeatureGroup::Tmass => TMASS_BANDS.len(),
            FeatureGroup::Wise => WISE_BANDS.len(),
            FeatureGroup::Apogee => n_pixels,
        }
    }

    /// Only the spectral columns are L1-penalized.
    pub fn is_penalized(&self) -> bool {
        matches!(self, FeatureGroup::Apogee)
    }
}

/// Fixed column layout for a given number of kept spectral pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSchema {
    n_pixels: usize,
}

impl FeatureSchema {
    pub fn new(n_pixels: usize) -> Self {
        FeatureSchema { n_pixels }
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn n_columns(&self) -> usize {
        FeatureGroup::ALL
            .iter()
            .map(|g| g.width(self.n_pixels))
            .sum()
    }

    /// Half-open column range of a group.
    pub fn group_range(&self, group: FeatureGroup) -> std::ops::Range<usize> {
        let mut start = 0;
        for g in FeatureGroup::ALL {
            let width = g.width(self.n_pixels);
            if g == group {
                return start..start + width;
            }
            start += width;
        }
        unreachable!("every group is in FeatureGroup::ALL");
    }

    /// Column names, for diagnostics and persisted-model metadata.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec!["constant".to_string()];
        names.extend(GAIA_BANDS.iter().map(|b| format!("gaia/phot_{b}_mean_mag")));
        names.extend(TMASS_BANDS.iter().map(|b| format!("tmass/{b}")));
        names.extend(WISE_BANDS.iter().map(|b| format!("wise/{b}")));
        names.extend((0..self.n_pixels).map(|i| format!("apogee/pix_{i:04}")));
        names
    }

    /// Binary penalty mask: 1 for penalized (spectral) columns, 0 elsewhere.
    pub fn penalty_mask(&self) -> DVector<f64> {
        let mut mask = DVector::zeros(self.n_columns());
        for j in self.group_range(FeatureGroup::Apogee) {
            mask[j] = 1.0;
        }
        mask
    }
}

/// The assembled regression inputs for one sample of stars.
#[derive(Debug, Clone)]
pub struct Design {
    pub schema: FeatureSchema,
    /// One row per star, one column per feature.
    pub x: DMatrix<f64>,
    /// Per-entry feature errors, same shape as `x` (diagnostic; the fit
    /// weights observations, not features).
    pub errors: DMatrix<f64>,
    /// Binary penalty mask over columns.
    pub penalty: DVector<f64>,
}

/// Assemble the design matrix, feature errors and penalty mask.
///
/// Arguments
/// -----------------
/// * `catalog`: the (already cut) sample; row order defines design rows.
/// * `normed`: one normalized spectrum per catalog row, all on the same
///   kept-pixel grid.
///
/// Return
/// ----------
/// * The [`Design`], or [`ParallaxError::ShapeMismatch`] when the spectrum
///   count or any pixel count disagrees with the catalog and schema.
pub fn build_design(
    catalog: &Catalog,
    normed: &[NormalizedSpectrum],
) -> Result<Design, ParallaxError> {
    if normed.len() != catalog.len() {
        return Err(ParallaxError::ShapeMismatch(format!(
            "{} normalized spectra for a catalog of {} rows",
            normed.len(),
            catalog.len()
        )));
    }
    if catalog.is_empty() {
        return Err(ParallaxError::InvalidCatalog(
            "cannot build a design matrix from an empty catalog".to_string(),
        ));
    }

    let n_pixels = normed[0].flux.len();
    for (row, spectrum) in normed.iter().enumerate() {
        if spectrum.flux.len() != n_pixels || spectrum.error.len() != n_pixels {
            return Err(ParallaxError::ShapeMismatch(format!(
                "spectrum in row {row} has {} pixels, expected {n_pixels}",
                spectrum.flux.len()
            )));
        }
    }

    let schema = FeatureSchema::new(n_pixels);
    let n = catalog.len();
    let d = schema.n_columns();
    let g = &catalog.gaia;
    let a = &catalog.apogee;
    let w = &catalog.wise;

    let (clip_lo, clip_hi) = FLUX_CLIP;
    let mut x = DMatrix::zeros(n, d);
    let mut errors = DMatrix::zeros(n, d);

    for i in 0..n {
        let mut j = 0;
        // constant
        x[(i, j)] = 1.0;
        errors[(i, j)] = 0.0;
        j += 1;

        // gaia magnitudes; errors from the flux-error ratio
        for (mag, flux, flux_err) in [
            (&g.phot_g_mean_mag, &g.phot_g_mean_flux, &g.phot_g_mean_flux_error),
            (
                &g.phot_bp_mean_mag,
                &g.phot_bp_mean_flux,
                &g.phot_bp_mean_flux_error,
            ),
            (
                &g.phot_rp_mean_mag,
                &g.phot_rp_mean_flux,
                &g.phot_rp_mean_flux_error,
            ),
        ] {
            x[(i, j)] = mag[i];
            errors[(i, j)] = FLUX_TO_MAG_ERR * flux_err[i] / flux[i];
            j += 1;
        }

        // 2MASS
        for (mag, err) in [(&a.j, &a.j_err), (&a.h, &a.h_err), (&a.k, &a.k_err)] {
            x[(i, j)] = mag[i];
            errors[(i, j)] = err[i];
            j += 1;
        }

        // WISE
        for (mag, err) in [
            (&w.w1mpro, &w.w1mpro_error),
            (&w.w2mpro, &w.w2mpro_error),
        ] {
            x[(i, j)] = mag[i];
            errors[(i, j)] = err[i];
            j += 1;
        }

        // spectral pixels: log of clipped normalized flux. The error is
        // carried through the log as if it were linear around 1, which is
        // what the clip guarantees to first order.
        for (flux, err) in normed[i].flux.iter().zip(&normed[i].error) {
            let clipped = flux.clamp(clip_lo, clip_hi);
            x[(i, j)] = clipped.ln();
            errors[(i, j)] = err.clamp(0.0, FLUX_ERR_CLIP) / clipped;
            j += 1;
        }

        debug_assert_eq!(j, d);
    }

    Ok(Design {
        schema,
        x,
        errors,
        penalty: schema.penalty_mask(),
    })
}

/// Regression targets and observation weights for a sample.
///
/// `y` is the zero-point-corrected parallax; `w` the inverse parallax
/// variance, so precisely measured stars dominate the fit.
pub fn targets(catalog: &Catalog) -> (DVector<f64>, DVector<f64>) {
    let g = &catalog.gaia;
    let y = DVector::from_iterator(
        catalog.len(),
        g.parallax.iter().map(|p| p + PARALLAX_OFFSET),
    );
    let w = DVector::from_iterator(
        catalog.len(),
        g.parallax_error.iter().map(|e| 1.0 / (e * e)),
    );
    (y, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::cuts::test_support::small_catalog;
    use approx::assert_relative_eq;

    fn flat_spectra(n: usize, pixels: usize) -> Vec<NormalizedSpectrum> {
        (0..n)
            .map(|_| NormalizedSpectrum {
                flux: vec![1.0; pixels],
                error: vec![0.02; pixels],
                mask: vec![0; pixels],
            })
            .collect()
    }

    #[test]
    fn schema_layout_is_stable() {
        let schema = FeatureSchema::new(4);
        assert_eq!(schema.n_columns(), 1 + 3 + 3 + 2 + 4);
        assert_eq!(schema.group_range(FeatureGroup::Constant), 0..1);
        assert_eq!(schema.group_range(FeatureGroup::Gaia), 1..4);
        assert_eq!(schema.group_range(FeatureGroup::Tmass), 4..7);
        assert_eq!(schema.group_range(FeatureGroup::Wise), 7..9);
        assert_eq!(schema.group_range(FeatureGroup::Apogee), 9..13);
        assert_eq!(schema.column_names().len(), schema.n_columns());
        assert_eq!(schema.column_names()[0], "constant");
        assert_eq!(schema.column_names()[9], "apogee/pix_0000");
    }

    #[test]
    fn only_spectral_columns_are_penalized() {
        let schema = FeatureSchema::new(5);
        let mask = schema.penalty_mask();
        for j in 0..schema.n_columns() {
            let expected = if schema.group_range(FeatureGroup::Apogee).contains(&j) {
                1.0
            } else {
                0.0
            };
            assert_eq!(mask[j], expected);
        }
    }

    #[test]
    fn design_rows_match_the_catalog() {
        let catalog = small_catalog(3);
        let design = build_design(&catalog, &flat_spectra(3, 4)).unwrap();
        assert_eq!(design.x.nrows(), 3);
        assert_eq!(design.x.ncols(), design.schema.n_columns());

        // Row 1 photometry lands in the expected columns.
        assert_relative_eq!(design.x[(1, 0)], 1.0);
        assert_relative_eq!(design.x[(1, 1)], catalog.gaia.phot_g_mean_mag[1]);
        assert_relative_eq!(design.x[(1, 4)], catalog.apogee.j[1]);
        assert_relative_eq!(design.x[(1, 7)], catalog.wise.w1mpro[1]);
        // Flat spectrum: ln(1) = 0.
        assert_relative_eq!(design.x[(1, 9)], 0.0);
        assert_relative_eq!(design.errors[(1, 9)], 0.02);
    }

    #[test]
    fn spectral_flux_is_clipped_before_the_log() {
        let catalog = small_catalog(1);
        let mut spectra = flat_spectra(1, 2);
        spectra[0].flux = vec![1.0e-6, 50.0]; // far outside the clip range
        spectra[0].error = vec![0.5, 0.5]; // above the error ceiling

        let design = build_design(&catalog, &spectra).unwrap();
        let range = design.schema.group_range(FeatureGroup::Apogee);
        assert_relative_eq!(design.x[(0, range.start)], FLUX_CLIP.0.ln());
        assert_relative_eq!(design.x[(0, range.start + 1)], FLUX_CLIP.1.ln());
        assert_relative_eq!(
            design.errors[(0, range.start)],
            FLUX_ERR_CLIP / FLUX_CLIP.0
        );
    }

    #[test]
    fn mismatched_spectrum_count_is_rejected() {
        let catalog = small_catalog(3);
        let result = build_design(&catalog, &flat_spectra(2, 4));
        assert!(matches!(result, Err(ParallaxError::ShapeMismatch(_))));
    }

    #[test]
    fn ragged_pixel_counts_are_rejected() {
        let catalog = small_catalog(2);
        let mut spectra = flat_spectra(2, 4);
        spectra[1].flux.pop();
        spectra[1].error.pop();
        let result = build_design(&catalog, &spectra);
        assert!(matches!(result, Err(ParallaxError::ShapeMismatch(_))));
    }

    #[test]
    fn targets_apply_offset_and_inverse_variance() {
        let catalog = small_catalog(2);
        let (y, w) = targets(&catalog);
        assert_relative_eq!(y[0], catalog.gaia.parallax[0] + PARALLAX_OFFSET);
        let e = catalog.gaia.parallax_error[1];
        assert_relative_eq!(w[1], 1.0 / (e * e));
    }
}
