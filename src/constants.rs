//! # Constants and type definitions for Parallax
//!
//! This module centralizes the **domain constants** and **common type
//! definitions** used throughout the `parallax` crate: the APOGEE detector
//! chip boundaries, the photometric band lists of each survey, the error
//! ceiling applied during continuum normalization, and the thresholds of the
//! astrometric training cuts.
//!
//! These values are inherited from astrophysical convention (APOGEE DR14,
//! Gaia DR2) rather than derived; changing them changes the meaning of every
//! fitted coefficient vector.

// -------------------------------------------------------------------------------------------------
// Continuum normalization
// -------------------------------------------------------------------------------------------------

/// Ceiling applied to spectral flux errors (normalized flux units).
///
/// Pixels with a non-finite or non-positive error are assigned this value,
/// and the inverse-variance weights are floored with it so that bad pixels
/// contribute negligibly to the continuum fit without making it singular.
pub const ERROR_LIM: f64 = 3.0;

/// Flux substituted for pixels carrying no usable information.
pub const FLAT_FLUX: f64 = 1.0;

/// Degree of the per-chip Chebyshev continuum polynomial.
pub const CONTINUUM_DEGREE: usize = 2;

/// APOGEE detector chips as `(name, lower, upper)` wavelength bounds in Å.
///
/// Boundaries are **exclusive**: a pixel belongs to a chip iff
/// `lower < λ < upper`. Chips are applied in order; the small b/c overlap is
/// resolved in favor of chip `c`, matching the reference reduction.
pub const CHIPS: [(&str, Angstrom, Angstrom); 3] = [
    ("a", 15150.0, 15800.0),
    ("b", 15890.0, 16540.0),
    ("c", 16490.0, 16950.0),
];

// -------------------------------------------------------------------------------------------------
// Photometry and regression features
// -------------------------------------------------------------------------------------------------

/// Gaia photometric bands entering the design matrix, in column order.
pub const GAIA_BANDS: [&str; 3] = ["g", "bp", "rp"];

/// 2MASS photometric bands entering the design matrix, in column order.
pub const TMASS_BANDS: [&str; 3] = ["j", "h", "k"];

/// WISE photometric bands entering the design matrix, in column order.
pub const WISE_BANDS: [&str; 2] = ["w1mpro", "w2mpro"];

/// Global Gaia DR2 parallax zero-point offset (mas), added to catalog
/// parallaxes before fitting.
pub const PARALLAX_OFFSET: MilliArcSec = 0.0483;

/// Conversion from relative flux error to magnitude error: 2.5 / ln(10).
pub const FLUX_TO_MAG_ERR: f64 = 1.09;

/// Normalized flux is clamped to this range before taking the log, so a
/// handful of pathological pixels cannot dominate a star's feature row.
pub const FLUX_CLIP: (f64, f64) = (0.01, 1.2);

/// Ceiling on normalized flux errors entering the design-error matrix.
pub const FLUX_ERR_CLIP: f64 = 0.05;

// -------------------------------------------------------------------------------------------------
// Astrometric quality cuts
// -------------------------------------------------------------------------------------------------

/// Minimum number of Gaia visibility periods for a trustworthy solution.
pub const MIN_VISIBILITY_PERIODS: u32 = 8;

/// Maximum astrometric χ² per degree of freedom (`chi2 / (n_good − 5)`).
pub const MAX_CHI2_PER_DOF: f64 = 2.0;

/// Maximum relative parallax error `σ_ϖ / ϖ` for the training sample.
pub const MAX_RELATIVE_PARALLAX_ERROR: f64 = 0.1;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Wavelength in Ångström
pub type Angstrom = f64;
/// Apparent magnitude
pub type Magnitude = f64;
/// Parallax (or parallax error) in milliarcseconds
pub type MilliArcSec = f64;
