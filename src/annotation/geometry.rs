//! Core geometry types: points, bounding rectangles and polygon filling.

use serde::{Deserialize, Serialize};

// ============================================================================
// Point
// ============================================================================

/// A position in level-0 pixel coordinates.
///
/// Serialized as an `[x, y]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Distance to the segment `a`-`b`.
    pub fn distance_to_segment(&self, a: &Point, b: &Point) -> f64 {
        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let len2 = dx * dx + dy * dy;
        if len2 == 0.0 {
            return self.distance_to(a);
        }
        let t = (((self.x - a.x) * dx + (self.y - a.y) * dy) / len2).clamp(0.0, 1.0);
        self.distance_to(&Point::new(a.x + t * dx, a.y + t * dy))
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Position of a level-0 point at a pyramid level of the given downsample.
///
/// Level-relative positions are derived on demand and never stored.
pub fn level_position(point: Point, downsample: f64) -> Point {
    Point::new(point.x / downsample, point.y / downsample)
}

// ============================================================================
// Bounding Rectangle
// ============================================================================

/// Axis-aligned bounds of a polygon, in level-0 pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingRect {
    /// Bounds of a vertex list, or `None` if it is empty.
    pub fn of(vertices: &[Point]) -> Option<Self> {
        let first = vertices.first()?;
        let init = Self {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        Some(vertices.iter().fold(init, |r, p| Self {
            min_x: r.min_x.min(p.x),
            min_y: r.min_y.min(p.y),
            max_x: r.max_x.max(p.x),
            max_y: r.max_y.max(p.y),
        }))
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Integer corners, clockwise from top-left, rounded outwards.
    pub fn corners(&self) -> [[i64; 2]; 4] {
        let (x0, y0) = (self.min_x.floor() as i64, self.min_y.floor() as i64);
        let (x1, y1) = (self.max_x.ceil() as i64, self.max_y.ceil() as i64);
        [[x0, y0], [x1, y0], [x1, y1], [x0, y1]]
    }
}

// ============================================================================
// Filling
// ============================================================================

/// Visit the pixel spans covered by a polygon.
///
/// A pixel `(x, y)` is covered when its centre `(x + 0.5, y + 0.5)` lies
/// inside the polygon under the nonzero winding rule. Centres exactly on a
/// left or top edge are inside, on a right or bottom edge outside, so
/// polygons sharing an edge never both cover a pixel.
///
/// Rows outside `rows` are not visited. `visit` receives the row and the
/// half-open column range `[x0, x1)` of each span, unclipped.
pub fn fill_spans(
    vertices: &[Point],
    rows: std::ops::Range<i64>,
    mut visit: impl FnMut(i64, i64, i64),
) {
    let Some(bounds) = BoundingRect::of(vertices) else {
        return;
    };
    if vertices.len() < 3 {
        return;
    }

    let first_row = (bounds.min_y - 0.5).ceil() as i64;
    let last_row = (bounds.max_y - 0.5).ceil() as i64;
    let start = first_row.max(rows.start);
    let end = last_row.min(rows.end);

    let mut crossings: Vec<(f64, i32)> = Vec::new();
    for y in start..end {
        let cy = y as f64 + 0.5;
        crossings.clear();

        for i in 0..vertices.len() {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];
            let dir = if a.y <= cy && cy < b.y {
                1
            } else if b.y <= cy && cy < a.y {
                -1
            } else {
                continue;
            };
            let x = a.x + (cy - a.y) * (b.x - a.x) / (b.y - a.y);
            crossings.push((x, dir));
        }
        crossings.sort_by(|l, r| l.0.total_cmp(&r.0));

        let mut winding = 0;
        for pair in crossings.windows(2) {
            winding += pair[0].1;
            if winding != 0 {
                let x0 = (pair[0].0 - 0.5).ceil() as i64;
                let x1 = (pair[1].0 - 0.5).ceil() as i64;
                if x1 > x0 {
                    visit(y, x0, x1);
                }
            }
        }
    }
}

/// All pixels covered by a polygon, row by row.
pub fn covered_pixels(vertices: &[Point]) -> Vec<[i64; 2]> {
    let mut pixels = Vec::new();
    fill_spans(vertices, i64::MIN..i64::MAX, |y, x0, x1| {
        pixels.extend((x0..x1).map(|x| [x, y]));
    });
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Point> {
        vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ]
    }

    #[test]
    fn test_point_serde_pair() {
        let p: Point = serde_json::from_str("[1.5, -2.0]").unwrap();
        assert_eq!(p, Point::new(1.5, -2.0));
        assert_eq!(serde_json::to_string(&p).unwrap(), "[1.5,-2.0]");
    }

    #[test]
    fn test_distance_to_segment() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(10.0, 0.0);
        assert_eq!(Point::new(5.0, 3.0).distance_to_segment(&a, &b), 3.0);
        assert_eq!(Point::new(13.0, 4.0).distance_to_segment(&a, &b), 5.0);
        assert_eq!(Point::new(3.0, 4.0).distance_to_segment(&a, &a), 5.0);
    }

    #[test]
    fn test_bounding_rect_corners() {
        let rect = BoundingRect::of(&[Point::new(1.2, 3.7), Point::new(8.5, 0.4)]).unwrap();
        assert_eq!(rect.corners(), [[1, 0], [9, 0], [9, 4], [1, 4]]);
        assert!(BoundingRect::of(&[]).is_none());
    }

    #[test]
    fn test_square_covers_exact_pixels() {
        let pixels = covered_pixels(&square(10.0, 10.0, 20.0, 20.0));
        assert_eq!(pixels.len(), 100);
        assert_eq!(pixels.first(), Some(&[10, 10]));
        assert_eq!(pixels.last(), Some(&[19, 19]));
    }

    #[test]
    fn test_fill_independent_of_orientation() {
        let mut ccw = square(10.0, 10.0, 20.0, 20.0);
        ccw.reverse();
        assert_eq!(covered_pixels(&ccw).len(), 100);
    }

    #[test]
    fn test_nonzero_winding_fills_overlap() {
        // the pentagram's centre has winding number 2
        let star: Vec<Point> = (0..5)
            .map(|i| {
                let a = std::f64::consts::PI * 2.0 * (i * 2 % 5) as f64 / 5.0;
                Point::new(50.0 + 40.0 * a.sin(), 50.0 - 40.0 * a.cos())
            })
            .collect();
        let pixels = covered_pixels(&star);
        assert!(pixels.contains(&[50, 50]));
    }

    #[test]
    fn test_shared_edge_not_double_covered() {
        let left = covered_pixels(&square(0.0, 0.0, 5.5, 4.0));
        let right = covered_pixels(&square(5.5, 0.0, 10.0, 4.0));
        assert!(left.iter().all(|p| !right.contains(p)));
        assert_eq!(left.len() + right.len(), 40);
    }

    #[test]
    fn test_level_position() {
        assert_eq!(
            level_position(Point::new(400.0, 100.0), 4.0),
            Point::new(100.0, 25.0)
        );
    }
}
