pub mod prediction;
pub mod thresholds;
