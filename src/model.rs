//! # Fitted-coefficient persistence
//!
//! The coefficient vector is the pipeline's only written artifact. It is
//! persisted as a versioned JSON document through any [`BlobCache`], and
//! read back as a flat float vector in the same column order the
//! [`FeatureSchema`](crate::features::FeatureSchema) produced it — the
//! schema's pixel count is stored alongside so a stale model cannot be
//! silently applied to a differently-shaped design matrix.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::features::FeatureSchema;
use crate::parallax_errors::ParallaxError;
use crate::storage::BlobCache;

/// A fitted, versioned coefficient vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coefficients {
    /// Model version, doubling as the storage key suffix.
    pub version: String,
    /// Kept spectral pixels the schema was built with.
    pub n_pixels: usize,
    /// One weight per design column, in schema order.
    pub values: Vec<f64>,
}

impl Coefficients {
    /// Package a solver solution for persistence.
    pub fn new(
        version: impl Into<String>,
        schema: &FeatureSchema,
        coefficients: &DVector<f64>,
    ) -> Result<Self, ParallaxError> {
        let version = version.into();
        if coefficients.len() != schema.n_columns() {
            return Err(ParallaxError::CoefficientLengthMismatch {
                version,
                found: coefficients.len(),
                expected: schema.n_columns(),
            });
        }
        Ok(Coefficients {
            version,
            n_pixels: schema.n_pixels(),
            values: coefficients.iter().copied().collect(),
        })
    }

    /// Storage key for a model version.
    pub fn key(version: &str) -> String {
        format!("parallax/models/{version}.json")
    }

    pub fn as_vector(&self) -> DVector<f64> {
        DVector::from_vec(self.values.clone())
    }

    /// Persist to the blob cache under [`Coefficients::key`].
    pub fn save(&self, cache: &dyn BlobCache) -> Result<(), ParallaxError> {
        let bytes = serde_json::to_vec(self)?;
        cache.write(&Self::key(&self.version), &bytes)
    }

    /// Load a model version and validate it against the expected schema.
    pub fn load(
        cache: &dyn BlobCache,
        version: &str,
        schema: &FeatureSchema,
    ) -> Result<Self, ParallaxError> {
        let bytes = cache.read(&Self::key(version))?;
        let coefficients: Coefficients = serde_json::from_slice(&bytes)?;
        if coefficients.values.len() != schema.n_columns()
            || coefficients.n_pixels != schema.n_pixels()
        {
            return Err(ParallaxError::CoefficientLengthMismatch {
                version: version.to_string(),
                found: coefficients.values.len(),
                expected: schema.n_columns(),
            });
        }
        Ok(coefficients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCache;

    #[test]
    fn round_trips_through_a_cache() {
        let schema = FeatureSchema::new(2);
        let b = DVector::from_vec(vec![0.5; schema.n_columns()]);
        let coeffs = Coefficients::new("v3", &schema, &b).unwrap();

        let cache = MemoryCache::new();
        coeffs.save(&cache).unwrap();
        let loaded = Coefficients::load(&cache, "v3", &schema).unwrap();
        assert_eq!(loaded, coeffs);
        assert_eq!(loaded.as_vector(), b);
    }

    #[test]
    fn missing_version_is_a_cache_miss() {
        let cache = MemoryCache::new();
        let result = Coefficients::load(&cache, "v9", &FeatureSchema::new(2));
        assert!(matches!(result, Err(ParallaxError::CacheMiss(_))));
    }

    #[test]
    fn wrong_schema_is_rejected_on_load() {
        let schema = FeatureSchema::new(2);
        let b = DVector::from_vec(vec![0.5; schema.n_columns()]);
        let coeffs = Coefficients::new("v3", &schema, &b).unwrap();
        let cache = MemoryCache::new();
        coeffs.save(&cache).unwrap();

        let result = Coefficients::load(&cache, "v3", &FeatureSchema::new(7));
        assert!(matches!(
            result,
            Err(ParallaxError::CoefficientLengthMismatch { .. })
        ));
    }

    #[test]
    fn length_mismatch_is_rejected_on_construction() {
        let schema = FeatureSchema::new(2);
        let b = DVector::from_vec(vec![0.5; 3]);
        assert!(matches!(
            Coefficients::new("v1", &schema, &b),
            Err(ParallaxError::CoefficientLengthMismatch { .. })
        ));
    }
}
