//! Toom-Cook matrices for `F(m, r)`: `m` outputs of an `r` tap correlation
//! from `m + r - 1` inputs.
//!
//! `y = Aᵀ [(G g) ⊙ (Bᵀ d)]`, where `y[i] = Σₖ d[i + k] g[k]`.

/// Finite interpolation points, used in order. Every transform adds the
/// point at infinity.
const POINTS: [f64; 11] = [0.0, 1.0, -1.0, 2.0, -2.0, 0.5, -0.5, 3.0, -3.0, 1.0 / 3.0, -1.0 / 3.0];

/// Largest `m + r - 1` the point table supports.
pub(crate) const MAX_ALPHA: usize = POINTS.len() + 1;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Transform {
    pub m: usize,
    pub r: usize,
    pub alpha: usize,
    /// `m x alpha`
    pub at: Vec<f64>,
    /// `alpha x r`
    pub g: Vec<f64>,
    /// `alpha x alpha`
    pub bt: Vec<f64>,
}

/// Coefficients, lowest power first, of `∏ (x - p)` over `points`.
fn poly_from_roots(points: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut coef = vec![1.0];
    for p in points {
        let mut next = vec![0.0; coef.len() + 1];
        for (i, c) in coef.iter().enumerate() {
            next[i] -= p * c;
            next[i + 1] += c;
        }
        coef = next;
    }
    coef
}

impl Transform {
    pub fn new(m: usize, r: usize) -> Self {
        let alpha = m + r - 1;
        assert!(m > 0 && r > 0 && alpha <= MAX_ALPHA, "no F({m}, {r}) transform");
        let n = alpha - 1;
        let pts = &POINTS[..n];

        let mut at = vec![0.0; m * alpha];
        for i in 0..m {
            for (j, a) in pts.iter().enumerate() {
                at[i * alpha + j] = a.powi(i as i32);
            }
            at[i * alpha + n] = if i == m - 1 { 1.0 } else { 0.0 };
        }

        let mut g = vec![0.0; alpha * r];
        for (j, a) in pts.iter().enumerate() {
            let den: f64 = pts
                .iter()
                .enumerate()
                .filter(|&(l, _)| l != j)
                .map(|(_, b)| a - b)
                .product();
            for k in 0..r {
                g[j * r + k] = a.powi(k as i32) / den;
            }
        }
        g[n * r + r - 1] = 1.0;

        let mut bt = vec![0.0; alpha * alpha];
        for j in 0..n {
            let others = pts.iter().enumerate().filter(|&(l, _)| l != j).map(|(_, p)| *p);
            for (k, c) in poly_from_roots(others).into_iter().enumerate() {
                bt[j * alpha + k] = c;
            }
        }
        for (k, c) in poly_from_roots(pts.iter().copied()).into_iter().enumerate() {
            bt[n * alpha + k] = c;
        }

        Self { m, r, alpha, at, g, bt }
    }

    #[inline(always)]
    pub fn at(&self, i: usize, j: usize) -> f64 {
        self.at[i * self.alpha + j]
    }

    #[inline(always)]
    pub fn g(&self, j: usize, k: usize) -> f64 {
        self.g[j * self.r + k]
    }

    #[inline(always)]
    pub fn bt(&self, j: usize, k: usize) -> f64 {
        self.bt[j * self.alpha + k]
    }
}
