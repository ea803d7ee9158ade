//! Frame background.

use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::appearance::CubeMap;
use crate::error::{J3dError, Result};

/// Solid color, optional four-corner gradient and optional sky reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Background {
    /// Clear color.
    pub color: Vec4,
    /// Corner colors in order: lower-left, lower-right, upper-right,
    /// upper-left. Indexed modulo the length.
    gradient: Vec<Vec4>,
    /// Scene-wide environment. When set, reflective materials mirror it
    /// instead of their own cube map.
    pub sky_reflection: Option<CubeMap>,
}

impl Background {
    #[must_use]
    pub fn solid(color: Vec4) -> Self {
        Self {
            color,
            gradient: Vec::new(),
            sky_reflection: None,
        }
    }

    /// Sets the gradient colors. Accepts zero or four colors.
    pub fn set_gradient(&mut self, gradient: Vec<Vec4>) -> Result<()> {
        if !(gradient.is_empty() || gradient.len() == 4) {
            return Err(J3dError::InvalidGradient(gradient.len()));
        }
        self.gradient = gradient;
        Ok(())
    }

    #[must_use]
    pub fn gradient(&self) -> &[Vec4] {
        &self.gradient
    }

    /// Corner colors to draw, or `None` for a plain clear.
    #[must_use]
    pub fn corner_colors(&self) -> Option<[Vec4; 4]> {
        let n = self.gradient.len();
        (n > 0).then(|| std::array::from_fn(|i| self.gradient[i % n]))
    }
}

impl Default for Background {
    fn default() -> Self {
        Self::solid(Vec4::new(0.0, 0.0, 0.0, 1.0))
    }
}
