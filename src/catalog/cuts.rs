//! # Sample selection cuts
//!
//! A [`Cut`] is a named boolean mask aligned to the catalog row index.
//! [`apply_cuts`] combines a set of cuts with an elementwise AND and logs,
//! for each cut independently, the fraction of the population it would
//! remove on its own — the per-cut yields are the main diagnostic when a
//! sample comes out unexpectedly small.
//!
//! Two predicate sets are used:
//!
//! * [`parent_cuts`] — the broad parent sample: stars with valid photometry
//!   in every band the regression uses, no Gaia duplicate flag, no
//!   variability flag. The model is *applied* to this sample.
//! * [`training_cuts`] — additionally requires a well-behaved, high-precision
//!   astrometric solution. The model is *fit* only on stars whose parallax
//!   is trustworthy, then applied more broadly.

use itertools::izip;
use log::info;

use crate::catalog::Catalog;
use crate::constants::{
    MAX_CHI2_PER_DOF, MAX_RELATIVE_PARALLAX_ERROR, MIN_VISIBILITY_PERIODS,
};
use crate::parallax_errors::ParallaxError;

/// A named selection predicate, evaluated to one boolean per catalog row.
#[derive(Debug, Clone)]
pub struct Cut {
    pub name: String,
    pub mask: Vec<bool>,
}

impl Cut {
    pub fn new(name: impl Into<String>, mask: Vec<bool>) -> Self {
        Cut {
            name: name.into(),
            mask,
        }
    }

    /// Fraction of rows this cut keeps.
    fn yield_fraction(&self) -> f64 {
        if self.mask.is_empty() {
            return 1.0;
        }
        self.mask.iter().filter(|&&m| m).count() as f64 / self.mask.len() as f64
    }
}

/// AND all cuts together, log each cut's independent yield and the overall
/// retained fraction, and return the filtered catalog.
///
/// Arguments
/// -----------------
/// * `catalog`: the catalog to filter.
/// * `cuts`: the named predicates; every mask must have one entry per row.
///
/// Return
/// ----------
/// * The filtered [`Catalog`], or [`ParallaxError::ShapeMismatch`] if a mask
///   is misaligned with the row index.
pub fn apply_cuts(catalog: &Catalog, cuts: &[Cut]) -> Result<Catalog, ParallaxError> {
    for cut in cuts {
        if cut.mask.len() != catalog.len() {
            return Err(ParallaxError::ShapeMismatch(format!(
                "cut {} has {} entries for a catalog of {} rows",
                cut.name,
                cut.mask.len(),
                catalog.len()
            )));
        }
    }

    let mut combined = vec![true; catalog.len()];
    for cut in cuts {
        info!(
            "{:>3.0}% of the population is cut away by {}",
            100.0 * (1.0 - cut.yield_fraction()),
            cut.name
        );
        for (c, &m) in combined.iter_mut().zip(&cut.mask) {
            *c &= m;
        }
    }

    let retained = if combined.is_empty() {
        1.0
    } else {
        combined.iter().filter(|&&m| m).count() as f64 / combined.len() as f64
    };
    info!("{:>3.0}% of the stars remain", 100.0 * retained);

    catalog.select(&combined)
}

/// Parent-sample predicates: every band the design matrix uses must be a
/// finite magnitude, the parallax error must be finite and positive, and
/// Gaia must flag neither duplication nor variability.
pub fn parent_cuts(catalog: &Catalog) -> Vec<Cut> {
    let a = &catalog.apogee;
    let g = &catalog.gaia;
    let w = &catalog.wise;

    let finite_tmass = izip!(&a.j, &a.h, &a.k)
        .map(|(j, h, k)| j.is_finite() && h.is_finite() && k.is_finite())
        .collect();

    let finite_gaia = izip!(
        &g.phot_g_mean_mag,
        &g.phot_bp_mean_mag,
        &g.phot_rp_mean_mag
    )
    .map(|(g, bp, rp)| g.is_finite() && bp.is_finite() && rp.is_finite())
    .collect();

    let finite_wise = izip!(&w.w1mpro, &w.w2mpro)
        .map(|(w1, w2)| w1.is_finite() && w2.is_finite())
        .collect();

    let good_parallax_error = g
        .parallax_error
        .iter()
        .map(|e| e.is_finite() && *e > 0.0)
        .collect();

    let not_duplicated = g.duplicated_source.iter().map(|d| !d).collect();
    let not_variable = g.phot_variable_flag.iter().map(|v| !v).collect();

    vec![
        Cut::new("finite 2MASS photometry", finite_tmass),
        Cut::new("finite Gaia photometry", finite_gaia),
        Cut::new("finite WISE photometry", finite_wise),
        Cut::new("finite positive parallax error", good_parallax_error),
        Cut::new("not a duplicated source", not_duplicated),
        Cut::new("not variability-flagged", not_variable),
    ]
}

/// Training-sample predicates, applied on top of the parent cuts: the
/// astrometric solution must be well observed (visibility periods), well
/// behaved (χ² per degree of freedom) and precise (relative parallax error).
pub fn training_cuts(catalog: &Catalog) -> Vec<Cut> {
    let g = &catalog.gaia;

    let visibility = g
        .visibility_periods_used
        .iter()
        .map(|&v| v >= MIN_VISIBILITY_PERIODS)
        .collect();

    // 5 astrometric parameters per source.
    let chi2 = izip!(&g.astrometric_chi2_al, &g.astrometric_n_good_obs_al)
        .map(|(&chi2, &n)| n > 5 && chi2 / (n as f64 - 5.0) < MAX_CHI2_PER_DOF)
        .collect();

    let precise = izip!(&g.parallax, &g.parallax_error)
        .map(|(&plx, &err)| plx > 0.0 && err / plx < MAX_RELATIVE_PARALLAX_ERROR)
        .collect();

    vec![
        Cut::new("enough visibility periods", visibility),
        Cut::new("bounded astrometric chi2/dof", chi2),
        Cut::new("precise parallax", precise),
    ]
}

#[cfg(any(test, doc))]
pub mod test_support {
    //! Small synthetic catalogs for unit tests.

    use crate::catalog::{ApogeeTable, Catalog, GaiaTable, WiseTable};

    /// A fully-finite, well-behaved `n`-row catalog. Row `i` has
    /// `source_id = i` and parallax `2 + i` mas with 1% errors, so every row
    /// passes both the parent and the training cuts.
    pub fn small_catalog(n: usize) -> Catalog {
        let f = |v: f64| (0..n).map(|i| v + i as f64 * 0.01).collect::<Vec<_>>();
        let apogee = ApogeeTable {
            tmass_id: (0..n).map(|i| format!("0000000{i}+000000")).collect(),
            telescope: vec!["apo25m".to_string(); n],
            location_id: vec![4102; n],
            file: (0..n).map(|i| format!("apStar-r8-{i}.fits")).collect(),
            j: f(11.0),
            h: f(10.5),
            k: f(10.4),
            j_err: vec![0.02; n],
            h_err: vec![0.02; n],
            k_err: vec![0.02; n],
        };
        let gaia = GaiaTable {
            source_id: (0..n as i64).collect(),
            parallax: (0..n).map(|i| 2.0 + i as f64).collect(),
            parallax_error: (0..n).map(|i| 0.01 * (2.0 + i as f64)).collect(),
            phot_g_mean_mag: f(13.0),
            phot_bp_mean_mag: f(13.4),
            phot_rp_mean_mag: f(12.5),
            phot_g_mean_flux: f(1.0e5),
            phot_bp_mean_flux: f(6.0e4),
            phot_rp_mean_flux: f(7.0e4),
            phot_g_mean_flux_error: vec![50.0; n],
            phot_bp_mean_flux_error: vec![120.0; n],
            phot_rp_mean_flux_error: vec![110.0; n],
            visibility_periods_used: vec![12; n],
            astrometric_chi2_al: vec![250.0; n],
            astrometric_n_good_obs_al: vec![220; n],
            phot_variable_flag: vec![false; n],
            duplicated_source: vec![false; n],
        };
        let wise = WiseTable {
            w1mpro: f(10.2),
            w1mpro_error: vec![0.03; n],
            w2mpro: f(10.3),
            w2mpro_error: vec![0.03; n],
        };
        Catalog::new(apogee, gaia, wise).expect("synthetic catalog is well formed")
    }
}
