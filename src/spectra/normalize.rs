//! # Continuum normalization
//!
//! Per-star, per-chip polynomial continuum fitting and removal, the signal
//! half of the parallax pipeline.
//!
//! ## Algorithm
//! -----------------
//! For each star:
//!
//! 1. Classify **bad pixels**: non-finite flux, or non-finite/non-positive
//!    error. Bad flux becomes [`FLAT_FLUX`], bad error becomes the
//!    configured error ceiling.
//! 2. Compute floored inverse-variance weights `1 / (lim² + err²)` — bad or
//!    huge-error pixels contribute negligibly to the fit without driving it
//!    singular.
//! 3. For each detector chip independently, fit a degree-2 weighted
//!    polynomial in the Chebyshev basis (chip-local domain mapped to
//!    `[-1, 1]`, which keeps the normal equations well conditioned across a
//!    ~2000 Å grid) and divide flux and error by the fitted continuum.
//! 4. **Reliability gate**: any pixel whose normalized error is negative,
//!    non-finite, or above [`NormParams::unreliable_above`] is forced back
//!    to the flat fallback `(1, lim)`.
//! 5. Bad pixels are re-clamped to the flat fallback, so a NaN input pixel
//!    always comes out as exactly `(1, lim)`.
//! 6. Pixels outside every chip are dropped from the output entirely.
//!
//! A chip whose weighted normal matrix cannot be Cholesky-factored (no
//! usable pixels, or fewer than the 3 the quadratic needs) is **skipped with
//! a warning**, leaving the flat fallback for its pixels. Upstream reductions
//! disagree on this edge; crashing a whole batch for one dead chip is the
//! worse failure mode.
//!
//! ## Batch execution
//! -----------------
//! [`normalize_batch`] distributes stars over the configured
//! [`ExecPolicy`](crate::exec::ExecPolicy); stars are independent, results
//! come back in catalog order. With the `progress` feature enabled a
//! progress bar tracks the batch.

use itertools::izip;
use log::warn;
use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::{Angstrom, ERROR_LIM, FLAT_FLUX};
use crate::exec::{run_batch, ExecPolicy};
use crate::parallax_errors::ParallaxError;
use crate::spectra::{ChipLayout, NormalizedSpectrum, Spectrum};

/// Tunable parameters of the continuum normalizer.
///
/// Defaults
/// -----------------
/// * `error_lim`: [`ERROR_LIM`] (= 3.0) — substituted error for bad pixels
///   and the floor term of the fit weights.
/// * `unreliable_above`: [`ERROR_LIM`] — post-normalization error threshold
///   above which a pixel is treated as uninformative. Observed reductions
///   disagree on this value (the error ceiling vs a fixed 0.3); neither is
///   canonical, so it is a parameter rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormParams {
    pub error_lim: f64,
    pub unreliable_above: f64,
}

impl Default for NormParams {
    fn default() -> Self {
        NormParams {
            error_lim: ERROR_LIM,
            unreliable_above: ERROR_LIM,
        }
    }
}

impl NormParams {
    pub fn builder() -> NormParamsBuilder {
        NormParamsBuilder::default()
    }
}

/// Builder for [`NormParams`] with validation at `build()`.
#[derive(Debug, Clone, Default)]
pub struct NormParamsBuilder {
    error_lim: Option<f64>,
    unreliable_above: Option<f64>,
}

impl NormParamsBuilder {
    pub fn error_lim(mut self, v: f64) -> Self {
        self.error_lim = Some(v);
        self
    }

    pub fn unreliable_above(mut self, v: f64) -> Self {
        self.unreliable_above = Some(v);
        self
    }

    pub fn build(self) -> Result<NormParams, ParallaxError> {
        let defaults = NormParams::default();
        let params = NormParams {
            error_lim: self.error_lim.unwrap_or(defaults.error_lim),
            unreliable_above: self.unreliable_above.unwrap_or(defaults.unreliable_above),
        };
        if !params.error_lim.is_finite() || params.error_lim <= 0.0 {
            return Err(ParallaxError::InvalidNormParams(format!(
                "error_lim must be finite and positive, got {}",
                params.error_lim
            )));
        }
        if !params.unreliable_above.is_finite() || params.unreliable_above <= 0.0 {
            return Err(ParallaxError::InvalidNormParams(format!(
                "unreliable_above must be finite and positive, got {}",
                params.unreliable_above
            )));
        }
        Ok(params)
    }
}

/// Degree-2 Chebyshev polynomial fitted over a chip-local domain.
#[derive(Debug, Clone, Copy)]
struct ContinuumFit {
    coeffs: Vector3<f64>,
    lo: Angstrom,
    hi: Angstrom,
}

impl ContinuumFit {
    /// Weighted least-squares fit of `c0·T0 + c1·T1 + c2·T2` through the
    /// chip pixels, solved via the 3×3 normal equations.
    ///
    /// Returns `None` when the normal matrix is not positive definite —
    /// degenerate domain, no pixels, or not enough independent ones.
    fn fit(wavelengths: &[Angstrom], flux: &[f64], weights: &[f64]) -> Option<Self> {
        let (lo, hi) = match wavelengths
            .iter()
            .fold(None, |acc: Option<(f64, f64)>, &w| match acc {
                None => Some((w, w)),
                Some((lo, hi)) => Some((lo.min(w), hi.max(w))),
            }) {
            Some(bounds) if bounds.1 > bounds.0 => bounds,
            _ => return None,
        };

        let mut ata = Matrix3::<f64>::zeros();
        let mut atb = Vector3::<f64>::zeros();
        for (&w, &f, &inv_var) in izip!(wavelengths, flux, weights) {
            let t = chebyshev_basis(scale(w, lo, hi));
            ata += inv_var * t * t.transpose();
            atb += inv_var * f * t;
        }

        let coeffs = ata.cholesky()?.solve(&atb);
        Some(ContinuumFit { coeffs, lo, hi })
    }

    fn eval(&self, wavelength: Angstrom) -> f64 {
        self.coeffs.dot(&chebyshev_basis(scale(wavelength, self.lo, self.hi)))
    }
}

/// Map a wavelength onto the Chebyshev domain `[-1, 1]`.
fn scale(w: Angstrom, lo: Angstrom, hi: Angstrom) -> f64 {
    2.0 * (w - lo) / (hi - lo) - 1.0
}

/// `[T0, T1, T2]` evaluated at `t`.
fn chebyshev_basis(t: f64) -> Vector3<f64> {
    Vector3::new(1.0, t, 2.0 * t * t - 1.0)
}

/// Normalize one star's spectrum against the chip layout.
///
/// Arguments
/// -----------------
/// * `layout`: shared grid-to-chip mapping for the batch.
/// * `spectrum`: the star's raw flux/error/mask, one value per grid pixel.
/// * `params`: normalizer tuning, see [`NormParams`].
///
/// Return
/// ----------
/// * The [`NormalizedSpectrum`] over the kept (in-chip) pixels, or
///   [`ParallaxError::ShapeMismatch`] if the spectrum length disagrees with
///   the grid.
pub fn normalize_one(
    layout: &ChipLayout,
    spectrum: &Spectrum,
    params: &NormParams,
) -> Result<NormalizedSpectrum, ParallaxError> {
    if spectrum.len() != layout.n_pixels() {
        return Err(ParallaxError::ShapeMismatch(format!(
            "spectrum has {} pixels, grid has {}",
            spectrum.len(),
            layout.n_pixels()
        )));
    }

    let lim = params.error_lim;
    let n = spectrum.len();

    let bad: Vec<bool> = izip!(&spectrum.flux, &spectrum.error)
        .map(|(f, e)| !f.is_finite() || !e.is_finite() || *e <= 0.0)
        .collect();

    let mut flux = spectrum.flux.clone();
    let mut error = spectrum.error.clone();
    for (i, &is_bad) in bad.iter().enumerate() {
        if is_bad {
            flux[i] = FLAT_FLUX;
            error[i] = lim;
        }
    }

    if bad.iter().all(|&b| b) {
        warn!("all pixels bad for one star; emitting the flat fallback");
    }

    let weights: Vec<f64> = error.iter().map(|e| 1.0 / (lim * lim + e * e)).collect();

    let mut norm_flux = vec![FLAT_FLUX; n];
    let mut norm_error = vec![lim; n];

    let wavelengths = layout.wavelengths();
    for (name, pixels) in layout.chip_pixels() {
        let chip_w: Vec<f64> = pixels.iter().map(|&i| wavelengths[i]).collect();
        let chip_f: Vec<f64> = pixels.iter().map(|&i| flux[i]).collect();
        let chip_iv: Vec<f64> = pixels.iter().map(|&i| weights[i]).collect();

        let Some(fit) = ContinuumFit::fit(&chip_w, &chip_f, &chip_iv) else {
            warn!("chip {name}: continuum fit is undefined, leaving the flat fallback");
            continue;
        };

        for &i in pixels {
            let continuum = fit.eval(wavelengths[i]);
            norm_flux[i] = flux[i] / continuum;
            norm_error[i] = error[i] / continuum;
        }
    }

    for i in 0..n {
        // Reliability gate. A negative continuum flips the error sign, which
        // is as uninformative as a huge one.
        let e = norm_error[i];
        let unreliable = !e.is_finite() || e < 0.0 || e > params.unreliable_above;
        if bad[i] || unreliable || !norm_flux[i].is_finite() {
            norm_flux[i] = FLAT_FLUX;
            norm_error[i] = lim;
        }
    }

    Ok(NormalizedSpectrum {
        flux: layout.kept().iter().map(|&i| norm_flux[i]).collect(),
        error: layout.kept().iter().map(|&i| norm_error[i]).collect(),
        mask: layout.kept().iter().map(|&i| spectrum.mask[i]).collect(),
    })
}

/// Normalize a batch of spectra sharing one wavelength grid, in catalog
/// order, under the given execution policy.
pub fn normalize_batch(
    layout: &ChipLayout,
    spectra: Vec<Spectrum>,
    params: &NormParams,
    policy: ExecPolicy,
) -> Result<Vec<NormalizedSpectrum>, ParallaxError> {
    #[cfg(feature = "progress")]
    let bar = {
        let bar = ProgressBar::new(spectra.len() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .expect("indicatif template"),
        );
        bar.set_message("normalizing");
        bar
    };

    let result = run_batch(policy, spectra, |spectrum| {
        let normed = normalize_one(layout, &spectrum, params)?;
        #[cfg(feature = "progress")]
        bar.inc(1);
        Ok(normed)
    });

    #[cfg(feature = "progress")]
    bar.finish_and_clear();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid() -> Vec<f64> {
        // 60 pixels across 100..700, all inside a single test chip.
        (0..60).map(|i| 100.0 + 10.0 * i as f64).collect()
    }

    fn layout() -> ChipLayout {
        ChipLayout::with_chips(grid(), &[("t", 50.0, 750.0)])
    }

    #[test]
    fn constant_flux_normalizes_to_unity() {
        let n = grid().len();
        let spectrum = Spectrum::new(vec![5.0; n], vec![0.1; n], vec![0; n]).unwrap();
        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        for &f in &normed.flux {
            assert_relative_eq!(f, 1.0, max_relative = 1e-10);
        }
        for &e in &normed.error {
            assert_relative_eq!(e, 0.1 / 5.0, max_relative = 1e-10);
        }
    }

    #[test]
    fn quadratic_trend_is_removed() {
        let g = grid();
        let n = g.len();
        let flux: Vec<f64> = g
            .iter()
            .map(|&w| 2.0 + 0.003 * w + 1.0e-6 * w * w)
            .collect();
        let spectrum = Spectrum::new(flux, vec![0.05; n], vec![0; n]).unwrap();
        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        for &f in &normed.flux {
            assert_relative_eq!(f, 1.0, max_relative = 1e-8);
        }
    }

    #[test]
    fn finite_input_gives_finite_output() {
        let n = grid().len();
        let flux: Vec<f64> = (0..n).map(|i| 3.0 + (i as f64 * 0.7).sin()).collect();
        let spectrum = Spectrum::new(flux, vec![0.2; n], vec![0; n]).unwrap();
        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        assert!(normed.flux.iter().all(|f| f.is_finite()));
        assert!(normed.error.iter().all(|e| e.is_finite()));
    }

    #[test]
    fn nan_pixel_is_a_flat_fixed_point() {
        let n = grid().len();
        let mut flux = vec![4.0; n];
        flux[17] = f64::NAN;
        let mut error = vec![0.1; n];
        error[23] = -1.0; // non-positive error is also "bad"
        let spectrum = Spectrum::new(flux, error, vec![0; n]).unwrap();

        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        assert_relative_eq!(normed.flux[17], FLAT_FLUX);
        assert_relative_eq!(normed.error[17], ERROR_LIM);
        assert_relative_eq!(normed.flux[23], FLAT_FLUX);
        assert_relative_eq!(normed.error[23], ERROR_LIM);
    }

    #[test]
    fn all_bad_star_becomes_flat() {
        let n = grid().len();
        let spectrum =
            Spectrum::new(vec![f64::NAN; n], vec![f64::NAN; n], vec![1; n]).unwrap();
        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        assert!(normed.flux.iter().all(|&f| f == FLAT_FLUX));
        assert!(normed.error.iter().all(|&e| e == ERROR_LIM));
    }

    #[test]
    fn unreliable_threshold_is_configurable() {
        let n = grid().len();
        let mut error = vec![0.05; n];
        error[10] = 2.0; // normalized error ≈ 0.4 for flux level 5
        let spectrum = Spectrum::new(vec![5.0; n], error, vec![0; n]).unwrap();

        let strict = NormParams::builder().unreliable_above(0.3).build().unwrap();
        let normed = normalize_one(&layout(), &spectrum, &strict).unwrap();
        assert_relative_eq!(normed.flux[10], FLAT_FLUX);
        assert_relative_eq!(normed.error[10], ERROR_LIM);

        // With the default ceiling (3.0) the same pixel survives.
        let normed = normalize_one(&layout(), &spectrum, &NormParams::default()).unwrap();
        assert!(normed.flux[10] != FLAT_FLUX || normed.error[10] != ERROR_LIM);
    }

    #[test]
    fn empty_chip_is_skipped_with_flat_fallback() {
        // Chip "v" covers no grid pixels at all, chip "w" only one.
        let layout = ChipLayout::with_chips(
            vec![10.0, 20.0, 30.0, 40.0],
            &[("v", 100.0, 200.0), ("w", 15.0, 25.0)],
        );
        let spectrum = Spectrum::new(vec![2.0; 4], vec![0.1; 4], vec![0; 4]).unwrap();
        let normed = normalize_one(&layout, &spectrum, &NormParams::default()).unwrap();
        // Only the pixel of chip "w" survives, with the flat fallback since
        // a single pixel cannot support a quadratic fit.
        assert_eq!(normed.flux, vec![FLAT_FLUX]);
        assert_eq!(normed.error, vec![ERROR_LIM]);
    }

    #[test]
    fn out_of_chip_pixels_are_excluded_not_masked() {
        let layout = ChipLayout::with_chips(grid(), &[("t", 195.0, 405.0)]);
        let n = grid().len();
        let spectrum = Spectrum::new(vec![1.0; n], vec![0.1; n], vec![0; n]).unwrap();
        let normed = normalize_one(&layout, &spectrum, &NormParams::default()).unwrap();
        assert_eq!(normed.flux.len(), layout.kept().len());
        assert_eq!(layout.kept_wavelengths().first(), Some(&200.0));
        assert_eq!(layout.kept_wavelengths().last(), Some(&400.0));
    }

    #[test]
    fn batch_matches_per_star_and_preserves_order() {
        let n = grid().len();
        let spectra: Vec<Spectrum> = (0..8)
            .map(|s| {
                let flux = (0..n).map(|i| 2.0 + s as f64 + (i as f64).cos()).collect();
                Spectrum::new(flux, vec![0.1; n], vec![0; n]).unwrap()
            })
            .collect();

        let params = NormParams::default();
        let layout = layout();
        let serial =
            normalize_batch(&layout, spectra.clone(), &params, ExecPolicy::Serial).unwrap();
        let threaded = normalize_batch(
            &layout,
            spectra.clone(),
            &params,
            ExecPolicy::Threaded { workers: 3 },
        )
        .unwrap();

        for (star, (a, b)) in serial.iter().zip(&threaded).enumerate() {
            let one = normalize_one(&layout, &spectra[star], &params).unwrap();
            assert_eq!(a.flux, one.flux);
            assert_eq!(a.flux, b.flux);
            assert_eq!(a.error, b.error);
        }
    }

    #[test]
    fn wrong_length_spectrum_is_rejected() {
        let spectrum = Spectrum::new(vec![1.0; 3], vec![0.1; 3], vec![0; 3]).unwrap();
        let result = normalize_one(&layout(), &spectrum, &NormParams::default());
        assert!(matches!(result, Err(ParallaxError::ShapeMismatch(_))));
    }

    #[test]
    fn builder_validates() {
        assert!(NormParams::builder().error_lim(-1.0).build().is_err());
        assert!(NormParams::builder().unreliable_above(0.0).build().is_err());
        let p = NormParams::builder()
            .error_lim(2.5)
            .unreliable_above(0.3)
            .build()
            .unwrap();
        assert_eq!(p.error_lim, 2.5);
        assert_eq!(p.unreliable_above, 0.3);
    }
}
