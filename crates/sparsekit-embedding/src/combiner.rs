//! Reduction of the rows requested by one (sample, slot) pair.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the rows requested by one (sample, slot) are reduced to one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combiner {
    /// Element-wise sum.
    Sum,
    /// Element-wise sum divided by the number of valid keys.
    Mean,
}

impl Default for Combiner {
    fn default() -> Self {
        Self::Sum
    }
}

impl Combiner {
    /// Turns the element-wise sum of a row into the combined vector.
    ///
    /// A row with zero valid keys is the zero vector for both combiners.
    pub fn finalize(&self, sum: &mut [f32], valid_count: u32) {
        if valid_count == 0 {
            sum.fill(0.0);
            return;
        }
        if let Combiner::Mean = self {
            scale(sum, 1.0 / valid_count as f32);
        }
    }

    /// Derivative of the combined vector with respect to each contributing row.
    pub fn row_scale(&self, valid_count: u32) -> f32 {
        match (self, valid_count) {
            (_, 0) => 0.0,
            (Combiner::Sum, _) => 1.0,
            (Combiner::Mean, n) => 1.0 / n as f32,
        }
    }

    /// Lowercase name as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Combiner::Sum => "sum",
            Combiner::Mean => "mean",
        }
    }
}

impl fmt::Display for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Combiner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(Combiner::Sum),
            "mean" => Ok(Combiner::Mean),
            other => Err(format!(
                "unknown combiner '{other}', expected 'sum' or 'mean'"
            )),
        }
    }
}

/// `dst += src`, element-wise.
pub(crate) fn accumulate(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// `values *= factor`, element-wise.
pub(crate) fn scale(values: &mut [f32], factor: f32) {
    for v in values {
        *v *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Sum".parse::<Combiner>().unwrap(), Combiner::Sum);
        assert_eq!("MEAN".parse::<Combiner>().unwrap(), Combiner::Mean);
        assert!("max".parse::<Combiner>().is_err());
    }

    #[test]
    fn test_finalize_mean() {
        let mut sum = vec![3.0, 6.0];
        Combiner::Mean.finalize(&mut sum, 3);
        assert_eq!(sum, vec![1.0, 2.0]);

        let mut sum = vec![3.0, 6.0];
        Combiner::Sum.finalize(&mut sum, 3);
        assert_eq!(sum, vec![3.0, 6.0]);
    }

    #[test]
    fn test_zero_valid_keys_give_zero_vector() {
        let mut sum = vec![0.0, 0.0];
        Combiner::Mean.finalize(&mut sum, 0);
        assert_eq!(sum, vec![0.0, 0.0]);
        assert_eq!(Combiner::Mean.row_scale(0), 0.0);
        assert_eq!(Combiner::Sum.row_scale(0), 0.0);
    }

    #[test]
    fn test_row_scale() {
        assert_eq!(Combiner::Sum.row_scale(4), 1.0);
        assert_eq!(Combiner::Mean.row_scale(4), 0.25);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Combiner::Mean).unwrap(), "\"mean\"");
        let parsed: Combiner = serde_json::from_str("\"sum\"").unwrap();
        assert_eq!(parsed, Combiner::Sum);
    }
}
