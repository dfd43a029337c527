//! Colour-card sampling.
//!
//! A card is a 6 x 4 grid of patches. Each patch is sampled in a small
//! central window; the per-channel median is the patch colour and the sum of
//! the per-channel standard deviations tells how uniform the window was.

use image::RgbImage;

/// Patch columns on the card.
pub const CARD_COLUMNS: u32 = 6;
/// Patch rows on the card.
pub const CARD_ROWS: u32 = 4;

/// sRGB values of the standard 24-patch chart, row-major from the top-left.
pub const DEFAULT_CARD_COLORS: [[f64; 3]; 24] = [
    [115.0, 82.0, 68.0],
    [194.0, 150.0, 130.0],
    [98.0, 122.0, 157.0],
    [87.0, 108.0, 67.0],
    [133.0, 128.0, 177.0],
    [103.0, 189.0, 170.0],
    [214.0, 126.0, 44.0],
    [80.0, 91.0, 166.0],
    [193.0, 90.0, 99.0],
    [94.0, 60.0, 108.0],
    [157.0, 188.0, 64.0],
    [224.0, 163.0, 46.0],
    [56.0, 61.0, 150.0],
    [70.0, 148.0, 73.0],
    [175.0, 54.0, 60.0],
    [231.0, 199.0, 31.0],
    [187.0, 86.0, 149.0],
    [8.0, 133.0, 161.0],
    [243.0, 243.0, 242.0],
    [200.0, 200.0, 200.0],
    [160.0, 160.0, 160.0],
    [122.0, 122.0, 121.0],
    [85.0, 85.0, 85.0],
    [52.0, 52.0, 52.0],
];

/// Sampled patch statistics in card order.
#[derive(Debug, Clone, PartialEq)]
pub struct CardSamples {
    /// Median RGB per patch.
    pub medians: Vec<[f64; 3]>,
    /// Sum of the RGB standard deviations per patch.
    pub std_sums: Vec<f64>,
}

impl CardSamples {
    /// Mean of the per-patch deviation sums.
    pub fn mean_std(&self) -> f64 {
        if self.std_sums.is_empty() {
            return 0.0;
        }
        self.std_sums.iter().sum::<f64>() / self.std_sums.len() as f64
    }
}

/// Sample the patches of a card occupying `[x, y, w, h]` in `img`.
///
/// With `rotated` the card is upside down and patches are returned in card
/// order regardless.
pub fn sample_card(img: &RgbImage, rect: [u32; 4], rotated: bool) -> CardSamples {
    let [x, y, w, h] = rect;
    let pw = w as f64 / CARD_COLUMNS as f64;
    let ph = h as f64 / CARD_ROWS as f64;
    let half = ((pw.min(ph) / 4.0).floor() as i64).max(1);

    let mut medians = Vec::with_capacity(24);
    let mut std_sums = Vec::with_capacity(24);
    for row in 0..CARD_ROWS {
        for col in 0..CARD_COLUMNS {
            let cx = (x as f64 + (col as f64 + 0.5) * pw).floor() as i64;
            let cy = (y as f64 + (row as f64 + 0.5) * ph).floor() as i64;
            let (median, std_sum) = sample_window(img, cx, cy, half);
            medians.push(median);
            std_sums.push(std_sum);
        }
    }
    if rotated {
        medians.reverse();
        std_sums.reverse();
    }
    CardSamples { medians, std_sums }
}

fn sample_window(img: &RgbImage, cx: i64, cy: i64, half: i64) -> ([f64; 3], f64) {
    let mut channels: [Vec<f64>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for yy in (cy - half)..(cy + half) {
        for xx in (cx - half)..(cx + half) {
            if xx < 0 || yy < 0 || xx >= img.width() as i64 || yy >= img.height() as i64 {
                continue;
            }
            let p = img.get_pixel(xx as u32, yy as u32);
            for c in 0..3 {
                channels[c].push(p[c] as f64);
            }
        }
    }
    let mut median = [0.0; 3];
    let mut std_sum = 0.0;
    for c in 0..3 {
        median[c] = median_of(&mut channels[c]);
        std_sum += std_dev(&channels[c]);
    }
    (median, std_sum)
}

/// Median of a sample (mean of the middle pair for even lengths).
pub fn median_of(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Paint a card with the given patch colours (row-major).
pub fn render_card(colors: &[[f64; 3]], patch: u32) -> RgbImage {
    RgbImage::from_fn(CARD_COLUMNS * patch, CARD_ROWS * patch, |x, y| {
        let i = ((y / patch) * CARD_COLUMNS + x / patch) as usize;
        let c = colors.get(i).copied().unwrap_or([0.0; 3]);
        image::Rgb([c[0] as u8, c[1] as u8, c[2] as u8])
    })
}
