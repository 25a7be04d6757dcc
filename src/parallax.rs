//! # Parallax: configuration, cache handle, and the end-to-end pipeline
//!
//! This module defines the [`Parallax`] struct, the central façade that
//! wires together:
//!
//! 1. **Configuration** ([`ParallaxConfig`]) — normalizer, fit and executor
//!    settings plus the model version, constructed once at process start.
//! 2. **Blob cache access** — the shared storage handle every cached
//!    artifact goes through.
//! 3. **The pipeline** — sample cuts → batch normalization → design matrix →
//!    two-stage regression → persisted coefficients.
//!
//! There is deliberately no global, lazily-initialized state anywhere in the
//! crate: everything a component needs arrives through a `&Parallax` (or
//! through the explicit parameter structs it carries), which is what makes
//! the pipeline testable against in-memory fakes.
//!
//! ## Two-stage fit
//!
//! The regression is fit twice: first on the high-confidence subset of stars
//! whose parallax signal-to-noise exceeds
//! [`FitParams::snr_min`](crate::solver::FitParams), then on the full
//! training sample **warm-started** from the subset solution. The warm start
//! speeds convergence and, on noisy data, biases the full fit away from the
//! poor local optima the naive initializer is prone to.

use std::sync::Arc;

use log::{info, warn};
use rand::Rng;

use crate::catalog::cuts::{apply_cuts, parent_cuts, training_cuts};
use crate::catalog::Catalog;
use crate::exec::ExecPolicy;
use crate::features::{build_design, targets, Design, FeatureGroup};
use crate::model::Coefficients;
use crate::parallax_errors::ParallaxError;
use crate::solver::lbfgs::{LogObserver, Solution};
use crate::solver::{self, FitParams};
use crate::spectra::normalize::{normalize_batch, NormParams};
use crate::spectra::{ChipLayout, NormalizedSpectrum, Spectrum};
use crate::storage::BlobCache;

/// Everything tunable about one pipeline run.
#[derive(Debug, Clone)]
pub struct ParallaxConfig {
    pub norm: NormParams,
    pub fit: FitParams,
    pub exec: ExecPolicy,
    /// Version string under which fitted coefficients are persisted.
    pub model_version: String,
}

impl Default for ParallaxConfig {
    fn default() -> Self {
        ParallaxConfig {
            norm: NormParams::default(),
            fit: FitParams::default(),
            exec: ExecPolicy::default(),
            model_version: "v1".to_string(),
        }
    }
}

/// The pipeline façade: configuration plus the storage handle.
pub struct Parallax {
    config: ParallaxConfig,
    cache: Arc<dyn BlobCache + Send + Sync>,
}

impl Parallax {
    pub fn new(config: ParallaxConfig, cache: Arc<dyn BlobCache + Send + Sync>) -> Self {
        Parallax { config, cache }
    }

    pub fn config(&self) -> &ParallaxConfig {
        &self.config
    }

    pub fn cache(&self) -> &dyn BlobCache {
        self.cache.as_ref()
    }

    /// The broad parent sample: stars with valid photometry and no
    /// duplication/variability flags. The fitted model is applied to this
    /// sample.
    pub fn parent_sample(&self, catalog: &Catalog) -> Result<Catalog, ParallaxError> {
        info!("selecting the parent sample from {} stars", catalog.len());
        apply_cuts(catalog, &parent_cuts(catalog))
    }

    /// The training sample: parent cuts plus the astrometric-quality cuts.
    /// The model is fit only on these stars.
    pub fn training_sample(&self, catalog: &Catalog) -> Result<Catalog, ParallaxError> {
        info!("selecting the training sample from {} stars", catalog.len());
        let mut cuts = parent_cuts(catalog);
        cuts.extend(training_cuts(catalog));
        apply_cuts(catalog, &cuts)
    }

    /// Continuum-normalize a batch of spectra under the configured executor.
    pub fn normalize(
        &self,
        layout: &ChipLayout,
        spectra: Vec<Spectrum>,
    ) -> Result<Vec<NormalizedSpectrum>, ParallaxError> {
        info!(
            "normalizing {} spectra on {} workers",
            spectra.len(),
            self.config.exec.workers()
        );
        normalize_batch(layout, spectra, &self.config.norm, self.config.exec)
    }

    /// Two-stage regression fit on an already-cut training sample.
    ///
    /// Arguments
    /// -----------------
    /// * `catalog`: the training sample (see [`Parallax::training_sample`]).
    /// * `normed`: one normalized spectrum per catalog row.
    /// * `rng`: randomness for the gradient self-check directions.
    ///
    /// Return
    /// ----------
    /// * The versioned [`Coefficients`] and the full-sample [`Solution`],
    ///   or the first fatal error (shape, gradient mismatch, or solver
    ///   non-convergence).
    pub fn fit<R: Rng + ?Sized>(
        &self,
        catalog: &Catalog,
        normed: &[NormalizedSpectrum],
        rng: &mut R,
    ) -> Result<(Coefficients, Solution), ParallaxError> {
        let design = build_design(catalog, normed)?;
        let (y, w) = targets(catalog);
        log_feature_error_summary(&design);

        let params = &self.config.fit;
        let subset = high_confidence_rows(catalog, params.snr_min);

        let mut observer = LogObserver::default();
        let stage_one = if subset.len() >= design.schema.n_columns().min(catalog.len()) && !subset.is_empty() {
            info!(
                "stage 1: fitting {} of {} stars with parallax S/N above {}",
                subset.len(),
                catalog.len(),
                params.snr_min
            );
            let x_sub = design.x.select_rows(subset.iter());
            let y_sub = y.select_rows(subset.iter());
            let w_sub = w.select_rows(subset.iter());
            Some(solver::fit(
                &x_sub,
                &y_sub,
                &w_sub,
                &design.penalty,
                params,
                None,
                Some(&mut observer),
                rng,
            )?)
        } else {
            warn!(
                "only {} stars pass the S/N floor; skipping the subset stage",
                subset.len()
            );
            None
        };

        info!("stage 2: fitting all {} stars", catalog.len());
        let solution = solver::fit(
            &design.x,
            &y,
            &w,
            &design.penalty,
            params,
            stage_one.as_ref().map(|s| &s.coefficients),
            Some(&mut observer),
            rng,
        )?;
        info!(
            "converged after {} iterations, loss {:.6e}",
            solution.iterations, solution.loss
        );

        let coefficients = Coefficients::new(
            self.config.model_version.clone(),
            &design.schema,
            &solution.coefficients,
        )?;
        Ok((coefficients, solution))
    }

    /// Persist fitted coefficients under the configured model version.
    pub fn save_coefficients(&self, coefficients: &Coefficients) -> Result<(), ParallaxError> {
        coefficients.save(self.cache())
    }

    /// Load the configured model version back, validated against `schema`.
    pub fn load_coefficients(
        &self,
        schema: &crate::features::FeatureSchema,
    ) -> Result<Coefficients, ParallaxError> {
        Coefficients::load(self.cache(), &self.config.model_version, schema)
    }
}

/// Row indices whose parallax signal-to-noise exceeds `snr_min`.
fn high_confidence_rows(catalog: &Catalog, snr_min: f64) -> Vec<usize> {
    let g = &catalog.gaia;
    (0..catalog.len())
        .filter(|&i| {
            let (plx, err) = (g.parallax[i], g.parallax_error[i]);
            err > 0.0 && plx / err > snr_min
        })
        .collect()
}

/// Log the median feature error per group, the quickest data-quality smell
/// test before a long fit.
fn log_feature_error_summary(design: &Design) {
    for group in FeatureGroup::ALL {
        let range = design.schema.group_range(group);
        let mut errors: Vec<f64> = design
            .errors
            .columns_range(range)
            .iter()
            .copied()
            .filter(|e| e.is_finite())
            .collect();
        if errors.is_empty() {
            continue;
        }
        errors.sort_by(|a, b| a.total_cmp(b));
        let median = errors[errors.len() / 2];
        info!("median {group:?} feature error: {median:.4}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::cuts::test_support::small_catalog;
    use crate::storage::MemoryCache;

    fn facade() -> Parallax {
        Parallax::new(ParallaxConfig::default(), Arc::new(MemoryCache::new()))
    }

    #[test]
    fn high_confidence_rows_respect_the_floor() {
        let mut catalog = small_catalog(3);
        catalog.gaia.parallax = vec![10.0, 10.0, 10.0];
        catalog.gaia.parallax_error = vec![0.5, 2.0, 0.9];
        let rows = high_confidence_rows(&catalog, 10.0);
        assert_eq!(rows, vec![0, 2]);
    }

    #[test]
    fn training_sample_is_a_subset_of_the_parent_sample() {
        let mut catalog = small_catalog(5);
        catalog.gaia.phot_variable_flag[0] = true; // fails parent
        catalog.gaia.visibility_periods_used[1] = 2; // fails training only

        let env = facade();
        let parent = env.parent_sample(&catalog).unwrap();
        let training = env.training_sample(&catalog).unwrap();
        assert_eq!(parent.len(), 4);
        assert_eq!(training.len(), 3);
        for id in &training.gaia.source_id {
            assert!(parent.gaia.source_id.contains(id));
        }
    }
}
