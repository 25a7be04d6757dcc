pub mod catalog;
pub mod constants;
pub mod exec;
pub mod features;
pub mod model;
pub mod parallax;
pub mod parallax_errors;
pub mod solver;
pub mod spectra;
pub mod storage;
