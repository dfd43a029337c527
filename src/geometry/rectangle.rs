//! Rectangle fitting helpers.

use crate::geometry::pyramid::FloatImage;

pub type Point = (f64, f64);

/// Four corners of a rectangle from two diagonal points and the
/// width/height aspect ratio, ordered top-left, bottom-left, bottom-right,
/// top-right.
pub fn rect_from_diagonal(p1: Point, p2: Point, aspect: f64) -> [Point; 4] {
    let (dx, dy) = (p2.0 - p1.0, p2.1 - p1.1);
    let diagonal = dx.hypot(dy);
    let aspect = aspect.abs().max(f64::EPSILON);
    let height = diagonal / (1.0 + aspect * aspect).sqrt();
    let width = height * aspect;

    // Rotate the width axis so that width * u + height * v lands on p2.
    let phi = dy.atan2(dx) - height.atan2(width);
    let u = (phi.cos(), phi.sin());
    let v = (-phi.sin(), phi.cos());
    let corners = [
        p1,
        (p1.0 + width * u.0, p1.1 + width * u.1),
        p2,
        (p1.0 + height * v.0, p1.1 + height * v.1),
    ];
    correct_point_order(corners, 1.0)
}

/// Sort four points into top-left, bottom-left, bottom-right, top-right.
///
/// Points are split into a left and right pair by x. When the split is
/// ambiguous (the second and third smallest x are within `tolerance`) the
/// points are ordered by angle around their centroid instead.
pub fn correct_point_order(points: [Point; 4], tolerance: f64) -> [Point; 4] {
    let mut by_x = points;
    by_x.sort_by(|a, b| a.0.total_cmp(&b.0));

    if (by_x[2].0 - by_x[1].0).abs() >= tolerance {
        let (mut left, mut right) = ([by_x[0], by_x[1]], [by_x[2], by_x[3]]);
        left.sort_by(|a, b| a.1.total_cmp(&b.1));
        right.sort_by(|a, b| a.1.total_cmp(&b.1));
        return [left[0], left[1], right[1], right[0]];
    }

    let cx = points.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / 4.0;
    let mut by_angle = points;
    // Image y grows downwards; sort counter-clockwise as seen on screen,
    // starting from the upper-left quadrant.
    let key = |p: &Point| {
        let a = (-(p.1 - cy)).atan2(p.0 - cx);
        let shifted = a - 3.0 * std::f64::consts::FRAC_PI_4;
        shifted.rem_euclid(std::f64::consts::TAU)
    };
    by_angle.sort_by(|a, b| key(a).total_cmp(&key(b)));
    [by_angle[0], by_angle[1], by_angle[2], by_angle[3]]
}

/// Axis-aligned rectangle `[x0, y0, x1, y1]` snapped inward to edges.
///
/// Each side moves inward by up to `max_inset` pixels to the position with
/// the strongest intensity step across it, which tightens rectangles drawn
/// around round pots.
pub fn snap_rect_inward(gray: &FloatImage, rect: [u32; 4], max_inset: u32) -> [u32; 4] {
    let [x0, y0, x1, y1] = rect;
    let x1 = x1.min(gray.width());
    let y1 = y1.min(gray.height());
    if x1 <= x0 + 2 || y1 <= y0 + 2 {
        return [x0, y0, x1, y1];
    }
    let max_x = ((x1 - x0) / 2).saturating_sub(1).min(max_inset);
    let max_y = ((y1 - y0) / 2).saturating_sub(1).min(max_inset);

    let col_step = |x: u32| -> f64 {
        (y0..y1)
            .map(|y| (gray.get(x + 1, y) - gray.get(x, y)).abs() as f64)
            .sum::<f64>()
    };
    let row_step = |y: u32| -> f64 {
        (x0..x1)
            .map(|x| (gray.get(x, y + 1) - gray.get(x, y)).abs() as f64)
            .sum::<f64>()
    };
    let best = |max: u32, f: &dyn Fn(u32) -> f64| -> u32 {
        let mut best = (0, 0.0);
        for d in 0..=max {
            let s = f(d);
            if s > best.1 {
                best = (d, s);
            }
        }
        best.0
    };

    let left = best(max_x, &|d| col_step(x0 + d));
    let right = best(max_x, &|d| col_step(x1 - 2 - d));
    let top = best(max_y, &|d| row_step(y0 + d));
    let bottom = best(max_y, &|d| row_step(y1 - 2 - d));
    [x0 + left, y0 + top, x1 - right, y1 - bottom]
}
