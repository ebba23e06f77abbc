//! Row initializers for keys admitted to a shard during training.
//!
//! - [`Initializer`] - trait producing one embedding row
//! - [`ZerosInitializer`], [`ConstantInitializer`]
//! - [`RandomUniformInitializer`], [`RandomNormalInitializer`]
//! - [`InitializerConfig`] - serde description, turned into an initializer by
//!   [`InitializerConfig::build`]
//!
//! # Example
//!
//! ```
//! use sparsekit_shard::initializer::{Initializer, RandomUniformInitializer};
//!
//! let initializer = RandomUniformInitializer::new(-0.05, 0.05);
//! let row = initializer.initialize(16);
//! assert_eq!(row.len(), 16);
//! ```

use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Generates initial values for a newly admitted embedding row.
///
/// Initializers must be `Send + Sync`; a shard may be moved between worker tasks.
pub trait Initializer: Send + Sync {
    /// Returns a vector of `dim` values.
    fn initialize(&self, dim: usize) -> Vec<f32>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Initializer that sets all values to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZerosInitializer;

impl Initializer for ZerosInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        vec![0.0; dim]
    }

    fn name(&self) -> &str {
        "zeros"
    }
}

/// Initializer that sets all values to a constant.
///
/// ```
/// use sparsekit_shard::initializer::{Initializer, ConstantInitializer};
///
/// let initializer = ConstantInitializer::new(0.5);
/// assert_eq!(initializer.initialize(3), vec![0.5, 0.5, 0.5]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantInitializer {
    value: f32,
}

impl ConstantInitializer {
    /// Creates a constant initializer.
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    /// Returns the constant value.
    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Initializer for ConstantInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        vec![self.value; dim]
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Samples uniformly from `[min_val, max_val)`.
#[derive(Debug, Clone, Copy)]
pub struct RandomUniformInitializer {
    min_val: f32,
    max_val: f32,
}

impl RandomUniformInitializer {
    /// Creates a new uniform random initializer.
    ///
    /// # Panics
    ///
    /// Panics if `min_val >= max_val`.
    pub fn new(min_val: f32, max_val: f32) -> Self {
        assert!(
            min_val < max_val,
            "min_val ({}) must be less than max_val ({})",
            min_val,
            max_val
        );
        Self { min_val, max_val }
    }

    /// Returns the minimum value.
    pub fn min_val(&self) -> f32 {
        self.min_val
    }

    /// Returns the maximum value.
    pub fn max_val(&self) -> f32 {
        self.max_val
    }
}

impl Default for RandomUniformInitializer {
    fn default() -> Self {
        Self {
            min_val: -0.05,
            max_val: 0.05,
        }
    }
}

impl Initializer for RandomUniformInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..dim)
            .map(|_| rng.gen_range(self.min_val..self.max_val))
            .collect()
    }

    fn name(&self) -> &str {
        "random_uniform"
    }
}

/// Samples from a normal distribution.
#[derive(Debug, Clone, Copy)]
pub struct RandomNormalInitializer {
    normal: Normal<f64>,
}

impl RandomNormalInitializer {
    /// Creates a new normal initializer.
    ///
    /// # Panics
    ///
    /// Panics if `stddev` is not a positive finite number.
    pub fn new(mean: f32, stddev: f32) -> Self {
        assert!(
            stddev.is_finite() && stddev > 0.0,
            "stddev ({}) must be positive",
            stddev
        );
        let normal = match Normal::new(mean as f64, stddev as f64) {
            Ok(normal) => normal,
            Err(e) => panic!("invalid normal distribution: {e}"),
        };
        Self { normal }
    }

    /// Returns the mean.
    pub fn mean(&self) -> f32 {
        self.normal.mean() as f32
    }

    /// Returns the standard deviation.
    pub fn stddev(&self) -> f32 {
        self.normal.std_dev() as f32
    }
}

impl Default for RandomNormalInitializer {
    fn default() -> Self {
        Self::new(0.0, 0.01)
    }
}

impl Initializer for RandomNormalInitializer {
    fn initialize(&self, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..dim).map(|_| self.normal.sample(&mut rng) as f32).collect()
    }

    fn name(&self) -> &str {
        "random_normal"
    }
}

/// Serializable description of an initializer.
///
/// ```
/// use sparsekit_shard::initializer::InitializerConfig;
///
/// let config: InitializerConfig =
///     serde_json::from_str(r#"{"type": "constant", "value": 1.5}"#).unwrap();
/// assert_eq!(config, InitializerConfig::Constant { value: 1.5 });
/// assert_eq!(config.build().name(), "constant");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitializerConfig {
    /// All zeros.
    Zeros,
    /// A constant value.
    Constant {
        /// Value of every element.
        value: f32,
    },
    /// Uniform in `[min_val, max_val)`.
    RandomUniform {
        /// Inclusive lower bound.
        min_val: f32,
        /// Exclusive upper bound.
        max_val: f32,
    },
    /// Normal distribution.
    RandomNormal {
        /// Mean.
        mean: f32,
        /// Standard deviation.
        stddev: f32,
    },
}

impl Default for InitializerConfig {
    fn default() -> Self {
        InitializerConfig::RandomUniform {
            min_val: -0.05,
            max_val: 0.05,
        }
    }
}

impl InitializerConfig {
    /// Checks parameters that would otherwise panic in [`InitializerConfig::build`].
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            InitializerConfig::RandomUniform { min_val, max_val } if !(min_val < max_val) => Err(
                format!("random_uniform requires min_val < max_val, got [{min_val}, {max_val})"),
            ),
            InitializerConfig::RandomNormal { stddev, .. }
                if !(stddev.is_finite() && stddev > 0.0) =>
            {
                Err(format!("random_normal requires a positive stddev, got {stddev}"))
            }
            _ => Ok(()),
        }
    }

    /// Creates the initializer this config describes.
    pub fn build(&self) -> Arc<dyn Initializer> {
        match *self {
            InitializerConfig::Zeros => Arc::new(ZerosInitializer),
            InitializerConfig::Constant { value } => Arc::new(ConstantInitializer::new(value)),
            InitializerConfig::RandomUniform { min_val, max_val } => {
                Arc::new(RandomUniformInitializer::new(min_val, max_val))
            }
            InitializerConfig::RandomNormal { mean, stddev } => {
                Arc::new(RandomNormalInitializer::new(mean, stddev))
            }
        }
    }
}
