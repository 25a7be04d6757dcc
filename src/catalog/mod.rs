//! # Cross-matched star catalog
//!
//! A [`Catalog`] holds one row per star across three **row-synchronized
//! sub-tables**, one per source survey:
//!
//! ```text
//! Catalog
//! ├── apogee (2MASS id, spectrum location, j/h/k photometry)
//! ├── gaia   (astrometry, g/bp/rp photometry, quality flags)
//! └── wise   (w1/w2 infrared photometry)
//! ```
//!
//! Row `i` of every sub-table refers to the same physical star; the 2MASS
//! identifier is the cross-match join key and is unique per star. The tables
//! are plain structures of typed columns rather than string-keyed frames, so
//! a missing or misnamed column is a compile error instead of a runtime
//! surprise.
//!
//! Catalogs are read-only snapshots: they are loaded once per run (from the
//! blob cache, falling back to a remote query on miss) and only ever shrink,
//! through mask-based row filtering in [`cuts`](crate::catalog::cuts).

pub mod cuts;

use crate::constants::{Magnitude, MilliArcSec};
use crate::parallax_errors::ParallaxError;

/// APOGEE sub-table: spectrum bookkeeping plus 2MASS j/h/k photometry
/// (2MASS magnitudes ride along in the APOGEE catalog files).
#[derive(Debug, Clone, Default)]
pub struct ApogeeTable {
    /// 2MASS identifier, the cross-survey join key (unique per star).
    pub tmass_id: Vec<String>,
    /// Telescope and field identifying where the apStar file lives.
    pub telescope: Vec<String>,
    pub location_id: Vec<u32>,
    /// apStar file name for bulk spectrum retrieval.
    pub file: Vec<String>,
    pub j: Vec<Magnitude>,
    pub h: Vec<Magnitude>,
    pub k: Vec<Magnitude>,
    pub j_err: Vec<Magnitude>,
    pub h_err: Vec<Magnitude>,
    pub k_err: Vec<Magnitude>,
}

/// Gaia sub-table: astrometric solution, G/BP/RP photometry and the quality
/// flags the astrometric cuts operate on.
#[derive(Debug, Clone, Default)]
pub struct GaiaTable {
    pub source_id: Vec<i64>,
    pub parallax: Vec<MilliArcSec>,
    pub parallax_error: Vec<MilliArcSec>,
    pub phot_g_mean_mag: Vec<Magnitude>,
    pub phot_bp_mean_mag: Vec<Magnitude>,
    pub phot_rp_mean_mag: Vec<Magnitude>,
    pub phot_g_mean_flux: Vec<f64>,
    pub phot_bp_mean_flux: Vec<f64>,
    pub phot_rp_mean_flux: Vec<f64>,
    pub phot_g_mean_flux_error: Vec<f64>,
    pub phot_bp_mean_flux_error: Vec<f64>,
    pub phot_rp_mean_flux_error: Vec<f64>,
    pub visibility_periods_used: Vec<u32>,
    pub astrometric_chi2_al: Vec<f64>,
    pub astrometric_n_good_obs_al: Vec<u32>,
    pub phot_variable_flag: Vec<bool>,
    pub duplicated_source: Vec<bool>,
}

/// WISE sub-table: w1/w2 profile-fit magnitudes and their errors.
#[derive(Debug, Clone, Default)]
pub struct WiseTable {
    pub w1mpro: Vec<Magnitude>,
    pub w1mpro_error: Vec<Magnitude>,
    pub w2mpro: Vec<Magnitude>,
    pub w2mpro_error: Vec<Magnitude>,
}

/// The cross-matched catalog: three sub-tables sharing one row index.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub apogee: ApogeeTable,
    pub gaia: GaiaTable,
    pub wise: WiseTable,
    len: usize,
}

impl Catalog {
    /// Assemble a catalog from its three sub-tables, checking that every
    /// column of every table has the same number of rows.
    ///
    /// Arguments
    /// -----------------
    /// * `apogee`, `gaia`, `wise`: the per-survey sub-tables, already joined
    ///   on the 2MASS identifier so that row `i` is the same star everywhere.
    ///
    /// Return
    /// ----------
    /// * The validated [`Catalog`], or [`ParallaxError::InvalidCatalog`] if
    ///   any column length disagrees.
    pub fn new(
        apogee: ApogeeTable,
        gaia: GaiaTable,
        wise: WiseTable,
    ) -> Result<Self, ParallaxError> {
        let len = apogee.tmass_id.len();
        let catalog = Catalog {
            apogee,
            gaia,
            wise,
            len,
        };
        catalog.check_lengths()?;
        Ok(catalog)
    }

    /// Number of stars (rows) in the catalog.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_lengths(&self) -> Result<(), ParallaxError> {
        let n = self.len;
        for (name, found) in self.column_lengths() {
            if found != n {
                return Err(ParallaxError::InvalidCatalog(format!(
                    "column {name} has {found} rows, expected {n}"
                )));
            }
        }
        Ok(())
    }

    fn column_lengths(&self) -> Vec<(&'static str, usize)> {
        let a = &self.apogee;
        let g = &self.gaia;
        let w = &self.wise;
        vec![
            ("apogee.tmass_id", a.tmass_id.len()),
            ("apogee.telescope", a.telescope.len()),
            ("apogee.location_id", a.location_id.len()),
            ("apogee.file", a.file.len()),
            ("apogee.j", a.j.len()),
            ("apogee.h", a.h.len()),
            ("apogee.k", a.k.len()),
            ("apogee.j_err", a.j_err.len()),
            ("apogee.h_err", a.h_err.len()),
            ("apogee.k_err", a.k_err.len()),
            ("gaia.source_id", g.source_id.len()),
            ("gaia.parallax", g.parallax.len()),
            ("gaia.parallax_error", g.parallax_error.len()),
            ("gaia.phot_g_mean_mag", g.phot_g_mean_mag.len()),
            ("gaia.phot_bp_mean_mag", g.phot_bp_mean_mag.len()),
            ("gaia.phot_rp_mean_mag", g.phot_rp_mean_mag.len()),
            ("gaia.phot_g_mean_flux", g.phot_g_mean_flux.len()),
            ("gaia.phot_bp_mean_flux", g.phot_bp_mean_flux.len()),
            ("gaia.phot_rp_mean_flux", g.phot_rp_mean_flux.len()),
            ("gaia.phot_g_mean_flux_error", g.phot_g_mean_flux_error.len()),
            (
                "gaia.phot_bp_mean_flux_error",
                g.phot_bp_mean_flux_error.len(),
            ),
            (
                "gaia.phot_rp_mean_flux_error",
                g.phot_rp_mean_flux_error.len(),
            ),
            (
                "gaia.visibility_periods_used",
                g.visibility_periods_used.len(),
            ),
            ("gaia.astrometric_chi2_al", g.astrometric_chi2_al.len()),
            (
                "gaia.astrometric_n_good_obs_al",
                g.astrometric_n_good_obs_al.len(),
            ),
            ("gaia.phot_variable_flag", g.phot_variable_flag.len()),
            ("gaia.duplicated_source", g.duplicated_source.len()),
            ("wise.w1mpro", w.w1mpro.len()),
            ("wise.w1mpro_error", w.w1mpro_error.len()),
            ("wise.w2mpro", w.w2mpro.len()),
            ("wise.w2mpro_error", w.w2mpro_error.len()),
        ]
    }

    /// Keep only the rows where `mask` is true, across all three sub-tables.
    ///
    /// Arguments
    /// -----------------
    /// * `mask`: one boolean per row, aligned to the shared row index.
    ///
    /// Return
    /// ----------
    /// * The filtered catalog, or [`ParallaxError::ShapeMismatch`] if the
    ///   mask length differs from the row count.
    pub fn select(&self, mask: &[bool]) -> Result<Catalog, ParallaxError> {
        if mask.len() != self.len {
            return Err(ParallaxError::ShapeMismatch(format!(
                "selection mask has {} entries for a catalog of {} rows",
                mask.len(),
                self.len
            )));
        }

        let a = &self.apogee;
        let g = &self.gaia;
        let w = &self.wise;
        let apogee = ApogeeTable {
            tmass_id: keep(&a.tmass_id, mask),
            telescope: keep(&a.telescope, mask),
            location_id: keep(&a.location_id, mask),
            file: keep(&a.file, mask),
            j: keep(&a.j, mask),
            h: keep(&a.h, mask),
            k: keep(&a.k, mask),
            j_err: keep(&a.j_err, mask),
            h_err: keep(&a.h_err, mask),
            k_err: keep(&a.k_err, mask),
        };
        let gaia = GaiaTable {
            source_id: keep(&g.source_id, mask),
            parallax: keep(&g.parallax, mask),
            parallax_error: keep(&g.parallax_error, mask),
            phot_g_mean_mag: keep(&g.phot_g_mean_mag, mask),
            phot_bp_mean_mag: keep(&g.phot_bp_mean_mag, mask),
            phot_rp_mean_mag: keep(&g.phot_rp_mean_mag, mask),
            phot_g_mean_flux: keep(&g.phot_g_mean_flux, mask),
            phot_bp_mean_flux: keep(&g.phot_bp_mean_flux, mask),
            phot_rp_mean_flux: keep(&g.phot_rp_mean_flux, mask),
            phot_g_mean_flux_error: keep(&g.phot_g_mean_flux_error, mask),
            phot_bp_mean_flux_error: keep(&g.phot_bp_mean_flux_error, mask),
            phot_rp_mean_flux_error: keep(&g.phot_rp_mean_flux_error, mask),
            visibility_periods_used: keep(&g.visibility_periods_used, mask),
            astrometric_chi2_al: keep(&g.astrometric_chi2_al, mask),
            astrometric_n_good_obs_al: keep(&g.astrometric_n_good_obs_al, mask),
            phot_variable_flag: keep(&g.phot_variable_flag, mask),
            duplicated_source: keep(&g.duplicated_source, mask),
        };
        let wise = WiseTable {
            w1mpro: keep(&w.w1mpro, mask),
            w1mpro_error: keep(&w.w1mpro_error, mask),
            w2mpro: keep(&w.w2mpro, mask),
            w2mpro_error: keep(&w.w2mpro_error, mask),
        };

        Catalog::new(apogee, gaia, wise)
    }
}

fn keep<T: Clone>(column: &[T], mask: &[bool]) -> Vec<T> {
    column
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|(v, _)| v.clone())
        .collect()
}
