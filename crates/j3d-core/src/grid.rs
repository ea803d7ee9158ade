//! Reference grid drawn on top of the scene.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::{J3dError, Result};

/// Grid in its own XY plane, measured in cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub enabled: bool,
    /// Grid-to-world transform.
    pub grid_to_world: Mat4,
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
    cell_size: i32,
    /// Draw the X and Y axes in a darker color.
    pub highlight_axes: bool,
    /// Emphasize every n-th line; values of 1 or less disable this.
    pub highlight_interval: i32,
}

/// Line segments of a grid, grouped by emphasis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridLines {
    pub regular: Vec<[Vec3; 2]>,
    pub highlight: Vec<[Vec3; 2]>,
    pub axes: Vec<[Vec3; 2]>,
}

impl GridLines {
    pub const REGULAR_COLOR: Vec4 = Vec4::new(0.75, 0.75, 0.75, 1.0);
    pub const HIGHLIGHT_COLOR: Vec4 = Vec4::new(0.5, 0.5, 0.5, 1.0);
    pub const AXIS_COLOR: Vec4 = Vec4::new(0.1, 0.1, 0.1, 1.0);
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            enabled: false,
            grid_to_world: Mat4::IDENTITY,
            min_x: -100,
            min_y: -100,
            max_x: 100,
            max_y: 100,
            cell_size: 1,
            highlight_axes: true,
            highlight_interval: 10,
        }
    }
}

impl Grid {
    #[must_use]
    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    pub fn set_cell_size(&mut self, cell_size: i32) -> Result<()> {
        if cell_size <= 0 {
            return Err(J3dError::InvalidCellSize(cell_size));
        }
        self.cell_size = cell_size;
        Ok(())
    }

    pub fn set_bounds(&mut self, min_x: i32, min_y: i32, max_x: i32, max_y: i32) {
        self.min_x = min_x;
        self.min_y = min_y;
        self.max_x = max_x;
        self.max_y = max_y;
    }

    fn is_highlighted(&self, cell: i32) -> bool {
        self.highlight_interval > 1 && cell % self.highlight_interval == 0
    }

    fn is_axis(&self, cell: i32) -> bool {
        self.highlight_axes && cell == 0
    }

    /// Generates line segments in grid space.
    ///
    /// Each grid line appears in exactly one class: axes take precedence
    /// over highlights, which take precedence over regular lines.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lines(&self) -> GridLines {
        let size = self.cell_size;
        let (min_x, max_x) = ((self.min_x * size) as f32, (self.max_x * size) as f32);
        let (min_y, max_y) = ((self.min_y * size) as f32, (self.max_y * size) as f32);
        let vertical = |x: i32| {
            let x = (x * size) as f32;
            [Vec3::new(x, min_y, 0.0), Vec3::new(x, max_y, 0.0)]
        };
        let horizontal = |y: i32| {
            let y = (y * size) as f32;
            [Vec3::new(min_x, y, 0.0), Vec3::new(max_x, y, 0.0)]
        };

        let mut lines = GridLines::default();
        for x in self.min_x..=self.max_x {
            if self.is_axis(x) {
                lines.axes.push(vertical(x));
            } else if self.is_highlighted(x) {
                lines.highlight.push(vertical(x));
            } else {
                lines.regular.push(vertical(x));
            }
        }
        for y in self.min_y..=self.max_y {
            if self.is_axis(y) {
                lines.axes.push(horizontal(y));
            } else if self.is_highlighted(y) {
                lines.highlight.push(horizontal(y));
            } else {
                lines.regular.push(horizontal(y));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_classes() {
        let mut grid = Grid::default();
        grid.set_bounds(-10, -5, 10, 5);
        grid.highlight_interval = 5;
        let lines = grid.lines();
        // x: -10, -5, 5, 10 highlighted; y: -5, 5 highlighted.
        assert_eq!(lines.axes.len(), 2);
        assert_eq!(lines.highlight.len(), 6);
        assert_eq!(lines.regular.len(), 21 + 11 - 2 - 6);
    }

    #[test]
    fn test_no_axes_outside_range() {
        let mut grid = Grid::default();
        grid.set_bounds(1, 1, 3, 3);
        grid.highlight_interval = 0;
        let lines = grid.lines();
        assert!(lines.axes.is_empty());
        assert!(lines.highlight.is_empty());
        assert_eq!(lines.regular.len(), 6);
    }

    #[test]
    fn test_cell_size_scales_lines() {
        let mut grid = Grid::default();
        grid.set_bounds(0, 0, 1, 1);
        grid.set_cell_size(4).unwrap();
        assert!(grid.set_cell_size(0).is_err());
        let lines = grid.lines();
        assert!(lines
            .regular
            .iter()
            .any(|l| l[0] == Vec3::new(4.0, 0.0, 0.0) && l[1] == Vec3::new(4.0, 4.0, 0.0)));
    }
}
