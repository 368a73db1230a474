//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! detected landmarks to the InsightFace reference positions and warps the
//! face into a 112x112 RGB image.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`. `None` when the landmarks
    /// are degenerate (for example, all at one point).
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        // Each pair gives two rows of A * [a, b, tx, ty]^T = B:
        //   [sx, -sy, 1, 0] -> dx
        //   [sy,  sx, 0, 1] -> dy
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            for (row, target) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * target;
                }
            }
        }

        let [a, b, tx, ty] = solve_4x4(ata, atb)?;
        let fitted = Self { a, b, tx, ty };
        (fitted.det() > 1e-12 && fitted.det().is_finite()).then_some(fitted)
    }

    fn det(&self) -> f32 {
        self.a * self.a + self.b * self.b
    }

    /// Map an output pixel back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.det();
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }
}

/// Gaussian elimination with partial pivoting. `None` if singular.
fn solve_4x4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-9 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of one pixel; out-of-bounds reads are black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let at = |px: i64, py: i64, c: usize| -> f32 {
        if px >= 0 && py >= 0 && px < i64::from(image.width()) && py < i64::from(image.height()) {
            f32::from(image.get_pixel(px as u32, py as u32)[c])
        } else {
            0.0
        }
    };

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let v = at(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
            + at(x0 + 1, y0, c) * fx * (1.0 - fy)
            + at(x0, y0 + 1, c) * (1.0 - fx) * fy
            + at(x0 + 1, y0 + 1, c) * fx * fy;
        *value = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Eyes closer than this (in source pixels) cannot be aligned.
const MIN_EYE_DISTANCE: f32 = 1.0;

/// Warp the face described by `landmarks` into a 112x112 aligned crop.
///
/// Returns `None` if the landmarks do not define a usable transform.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let ((lx, ly), (rx, ry)) = (landmarks[0], landmarks[1]);
    let eyes = (rx - lx).hypot(ry - ly);
    if eyes.is_nan() || eyes < MIN_EYE_DISTANCE {
        return None;
    }
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;

    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = transform.invert_point(ox as f32, oy as f32);
        sample(image, sx, sy)
    }))
}
