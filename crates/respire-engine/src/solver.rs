//! Numerical routines backing the lung subsystem
//!
//! Self-contained implementations of the numerics the mechanical model
//! needs: a natural cubic spline (with derivative evaluation), adaptive
//! Simpson quadrature, root bracketing plus Brent refinement, a damped 2×2
//! Newton solver, and an adaptive implicit (first-order) ODE stepper with
//! absolute error control.

use crate::error::{EngineError, Result};

/// Outcome of a bracketing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    /// lo/hi now straddle a sign change
    Ok,
    /// An exact root landed in lo
    Root,
    /// No sign change reachable
    NoRoot,
}

/// Starting from [lo, hi], expand and walk until the interval brackets a
/// sign change of `f`. The search follows the secant direction when the
/// residual is shrinking and doubles away from it otherwise.
pub fn bracket_root(f: &mut dyn FnMut(f64) -> f64, lo: &mut f64, hi: &mut f64) -> Bracket {
    let mut x0 = *lo;
    let mut y0 = f(x0);
    if !y0.is_finite() {
        return Bracket::NoRoot;
    }
    if y0 == 0.0 {
        return Bracket::Root;
    }
    let mut increment = *hi - *lo;
    loop {
        let x1 = x0 + increment;
        let y1 = f(x1);
        if y1.is_nan() {
            return Bracket::NoRoot;
        }
        if x1.abs() > 1e300 {
            return Bracket::NoRoot;
        }
        if y1 == 0.0 {
            *lo = x1;
            return Bracket::Root;
        }
        if y1 * y0 < 0.0 {
            *lo = x0.min(x1);
            *hi = x0.max(x1);
            return Bracket::Ok;
        }
        if y1.abs() >= y0.abs() {
            increment *= -2.0;
        } else {
            let newinc = -y0 / (y1 - y0) * (x1 - x0);
            if newinc.abs() > increment.abs() {
                increment = newinc;
            }
            y0 = y1;
            x0 = x1;
        }
    }
}

/// Brent's method on a bracketing interval [a, b]; converges when the
/// interval shrinks below `eps_abs + eps_rel·min(|a|, |b|)`.
pub fn brent(
    f: &mut dyn FnMut(f64) -> f64,
    mut a: f64,
    mut b: f64,
    eps_abs: f64,
    eps_rel: f64,
    max_iter: usize,
) -> Option<f64> {
    let mut fa = f(a);
    let mut fb = f(b);
    if fa == 0.0 {
        return Some(a);
    }
    if fb == 0.0 {
        return Some(b);
    }
    if fa * fb > 0.0 || !fa.is_finite() || !fb.is_finite() {
        return None;
    }

    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = b - a;

    for _ in 0..max_iter {
        if fb * fc > 0.0 {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol1 = 2.0 * f64::EPSILON * b.abs()
            + 0.5 * (eps_abs + eps_rel * a.abs().min(b.abs()));
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Some(b);
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // inverse quadratic / secant step
            let s = fb / fa;
            let (mut p, mut q);
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let qq = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * qq * (qq - r) - (b - a) * (r - 1.0));
                q = (qq - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }
        a = b;
        fa = fb;
        if d.abs() > tol1 {
            b += d;
        } else {
            b += if xm > 0.0 { tol1 } else { -tol1 };
        }
        fb = f(b);
        if !fb.is_finite() {
            return None;
        }
    }
    Some(b)
}

/// Bracket then refine a root of `f` starting around [lo, hi].
/// Returns `f64::MAX` when no root is reachable, letting scan-style callers
/// keep comparing values without an Option dance.
pub fn solve_root(f: &mut dyn FnMut(f64) -> f64, lo: f64, hi: f64) -> f64 {
    let mut a = lo;
    let mut b = hi;
    match bracket_root(f, &mut a, &mut b) {
        Bracket::Root => a,
        Bracket::NoRoot => f64::MAX,
        Bracket::Ok => brent(f, a, b, 0.0, 1e-6, 100).unwrap_or(f64::MAX),
    }
}

fn simpson(a: f64, fa: f64, b: f64, fb: f64, fm: f64) -> f64 {
    (b - a) / 6.0 * (fa + 4.0 * fm + fb)
}

#[allow(clippy::too_many_arguments)]
fn adaptive_simpson(
    f: &dyn Fn(f64) -> f64,
    a: f64,
    b: f64,
    fa: f64,
    fb: f64,
    fm: f64,
    whole: f64,
    tol: f64,
    depth: usize,
) -> f64 {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = f(lm);
    let frm = f(rm);
    let left = simpson(a, fa, m, fm, flm);
    let right = simpson(m, fm, b, fb, frm);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * tol {
        left + right + delta / 15.0
    } else {
        adaptive_simpson(f, a, m, fa, fm, flm, left, tol / 2.0, depth - 1)
            + adaptive_simpson(f, m, b, fm, fb, frm, right, tol / 2.0, depth - 1)
    }
}

/// Adaptive Simpson quadrature of `f` over [a, b]
pub fn integrate(f: &dyn Fn(f64) -> f64, a: f64, b: f64, tol: f64) -> f64 {
    let fa = f(a);
    let fb = f(b);
    let m = 0.5 * (a + b);
    let fm = f(m);
    let whole = simpson(a, fa, b, fb, fm);
    adaptive_simpson(f, a, b, fa, fb, fm, whole, tol, 40)
}

/// Natural cubic spline over ascending knots
#[derive(Debug, Clone)]
pub struct Spline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    y2: Vec<f64>,
}

impl Spline {
    /// Fit a natural spline; panics on fewer than three knots
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Self {
        let n = xs.len();
        assert!(n >= 3 && n == ys.len(), "spline needs matching knots");
        let mut y2 = vec![0.0; n];
        let mut u = vec![0.0; n];
        for i in 1..n - 1 {
            let sig = (xs[i] - xs[i - 1]) / (xs[i + 1] - xs[i - 1]);
            let p = sig * y2[i - 1] + 2.0;
            y2[i] = (sig - 1.0) / p;
            let du = (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])
                - (ys[i] - ys[i - 1]) / (xs[i] - xs[i - 1]);
            u[i] = (6.0 * du / (xs[i + 1] - xs[i - 1]) - sig * u[i - 1]) / p;
        }
        for k in (0..n - 1).rev() {
            y2[k] = y2[k] * y2[k + 1] + u[k];
        }
        Self { xs, ys, y2 }
    }

    /// Lowest knot
    pub fn x_min(&self) -> f64 {
        self.xs[0]
    }

    /// Highest knot
    pub fn x_max(&self) -> f64 {
        self.xs[self.xs.len() - 1]
    }

    fn segment(&self, x: f64) -> usize {
        match self.xs.binary_search_by(|v| v.partial_cmp(&x).unwrap()) {
            Ok(i) => i.min(self.xs.len() - 2),
            Err(i) => i.clamp(1, self.xs.len() - 1) - 1,
        }
    }

    /// Interpolated value at x
    pub fn eval(&self, x: f64) -> f64 {
        let klo = self.segment(x);
        let khi = klo + 1;
        let h = self.xs[khi] - self.xs[klo];
        let a = (self.xs[khi] - x) / h;
        let b = (x - self.xs[klo]) / h;
        a * self.ys[klo]
            + b * self.ys[khi]
            + ((a * a * a - a) * self.y2[klo] + (b * b * b - b) * self.y2[khi]) * h * h / 6.0
    }

    /// Interpolated first derivative at x
    pub fn deriv(&self, x: f64) -> f64 {
        let klo = self.segment(x);
        let khi = klo + 1;
        let h = self.xs[khi] - self.xs[klo];
        let a = (self.xs[khi] - x) / h;
        let b = (x - self.xs[klo]) / h;
        (self.ys[khi] - self.ys[klo]) / h
            + ((3.0 * b * b - 1.0) * self.y2[khi] - (3.0 * a * a - 1.0) * self.y2[klo]) * h / 6.0
    }
}

/// Residual and Jacobian of a two-equation system at a point
pub type FdfResult = Result<([f64; 2], [[f64; 2]; 2])>;

/// Outcome of the 2×2 Newton solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonStatus {
    /// Residual below tolerance
    Success,
    /// Function value or Jacobian went non-finite
    BadFunction,
    /// Iteration cap reached without convergence
    NoConvergence,
}

fn finite2(v: [f64; 2]) -> bool {
    v[0].is_finite() && v[1].is_finite()
}

/// Damped Newton iteration on a 2×2 system.
///
/// `fdf` returns residual and Jacobian, or an error when the underlying
/// model cannot be evaluated (which is propagated). Convergence is
/// `|f0| + |f1| < residual_tol`; a full step that worsens the residual is
/// halved a few times before being taken anyway.
pub fn newton2(
    fdf: &mut dyn FnMut([f64; 2]) -> FdfResult,
    x: &mut [f64; 2],
    residual_tol: f64,
    max_iter: usize,
) -> Result<NewtonStatus> {
    let (mut f, mut j) = fdf(*x)?;
    if !finite2(f) {
        return Ok(NewtonStatus::BadFunction);
    }

    for _ in 0..max_iter {
        let residual = f[0].abs() + f[1].abs();
        if residual < residual_tol {
            return Ok(NewtonStatus::Success);
        }

        let det = j[0][0] * j[1][1] - j[0][1] * j[1][0];
        if det == 0.0 || !det.is_finite() {
            return Ok(NewtonStatus::BadFunction);
        }
        let dx = [
            (-f[0] * j[1][1] + f[1] * j[0][1]) / det,
            (-f[1] * j[0][0] + f[0] * j[1][0]) / det,
        ];
        if !finite2(dx) {
            return Ok(NewtonStatus::BadFunction);
        }

        // damping: halve the step while it makes things worse
        let mut scale = 1.0;
        let mut best = None;
        for _ in 0..6 {
            let xt = [x[0] + scale * dx[0], x[1] + scale * dx[1]];
            let (ft, jt) = fdf(xt)?;
            if finite2(ft) {
                let rt = ft[0].abs() + ft[1].abs();
                if rt < residual || best.is_none() {
                    best = Some((xt, ft, jt));
                }
                if rt < residual {
                    break;
                }
            }
            scale *= 0.5;
        }
        match best {
            None => return Ok(NewtonStatus::BadFunction),
            Some((xt, ft, jt)) => {
                *x = xt;
                f = ft;
                j = jt;
            }
        }
    }
    Ok(NewtonStatus::NoConvergence)
}

/// Adaptive implicit (first-order) stepper with absolute error control
#[derive(Debug)]
pub struct ImplicitStepper {
    /// Current step size; adapted across calls
    pub h: f64,
    /// Absolute error tolerance per step
    pub atol: f64,
    /// Derivative at the end of the last accepted step
    pub dydt_out: [f64; 2],
}

/// Smallest step size before the stepper gives up
const H_MIN: f64 = 1e-14;

impl ImplicitStepper {
    /// Create a stepper with an initial step size and tolerance
    pub fn new(h0: f64, atol: f64) -> Self {
        Self {
            h: h0,
            atol,
            dydt_out: [0.0; 2],
        }
    }

    /// Advance one accepted step toward t1 (never past it), adapting h.
    pub fn step(
        &mut self,
        f: &mut dyn FnMut(f64, [f64; 2]) -> Result<[f64; 2]>,
        t: &mut f64,
        t1: f64,
        y: &mut [f64; 2],
    ) -> Result<()> {
        let mut h = self.h.min(t1 - *t);
        if h <= 0.0 {
            return Ok(());
        }

        for _ in 0..60 {
            let f0 = f(*t, *y)?;
            let predictor = [y[0] + h * f0[0], y[1] + h * f0[1]];

            // implicit Euler by fixed-point correction
            let mut yc = predictor;
            let mut fc = f0;
            for _ in 0..2 {
                fc = f(*t + h, yc)?;
                yc = [y[0] + h * fc[0], y[1] + h * fc[1]];
            }

            let yerr = [
                (yc[0] - predictor[0]).abs(),
                (yc[1] - predictor[1]).abs(),
            ];
            let err = yerr[0].max(yerr[1]);

            if err <= self.atol {
                *t += h;
                *y = yc;
                self.dydt_out = fc;
                // grow cautiously when the step was comfortably accurate
                if err < self.atol / 2.0 {
                    let grow = if err > 0.0 {
                        (self.atol / err).sqrt().min(5.0)
                    } else {
                        5.0
                    };
                    self.h = h * 0.9 * grow;
                } else {
                    self.h = h;
                }
                return Ok(());
            }

            let shrink = (0.9 * (self.atol / err).sqrt()).clamp(0.2, 0.9);
            h *= shrink;
            if h < H_MIN {
                break;
            }
        }
        Err(EngineError::numerical(
            "ODE stepper",
            format!("step size underflow at t = {:.9}, y = [{}, {}]", t, y[0], y[1]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brent_finds_root() {
        let mut f = |x: f64| x * x - 2.0;
        let root = brent(&mut f, 0.0, 2.0, 1e-12, 0.0, 100).unwrap();
        assert!((root - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_bracket_then_solve() {
        // root far outside the initial interval
        let mut f = |x: f64| x - 100.0;
        let root = solve_root(&mut f, 0.0, 1.0);
        assert!((root - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_solve_no_root() {
        let mut f = |x: f64| x * x + 1.0;
        assert_eq!(solve_root(&mut f, -1.0, 1.0), f64::MAX);
    }

    #[test]
    fn test_integrate_polynomial() {
        let v = integrate(&|x| x * x, 0.0, 3.0, 1e-10);
        assert!((v - 9.0).abs() < 1e-8);
        let v = integrate(&|x| x.sin(), 0.0, std::f64::consts::PI, 1e-10);
        assert!((v - 2.0).abs() < 1e-8);
    }

    #[test]
    fn test_spline_reproduces_smooth_function() {
        let n = 200;
        let xs: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64 * 3.0).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| (x * 1.3).sin()).collect();
        let spline = Spline::new(xs, ys);
        for &x in &[0.1, 0.77, 1.5, 2.9] {
            assert!((spline.eval(x) - (x * 1.3).sin()).abs() < 1e-5);
            assert!((spline.deriv(x) - 1.3 * (x * 1.3).cos()).abs() < 1e-3);
        }
    }

    #[test]
    fn test_newton2_converges() {
        // x² + y² = 4, x − y = 0  →  (√2, √2) from a nearby start
        let mut fdf = |x: [f64; 2]| -> FdfResult {
            let f = [x[0] * x[0] + x[1] * x[1] - 4.0, x[0] - x[1]];
            let j = [[2.0 * x[0], 2.0 * x[1]], [1.0, -1.0]];
            Ok((f, j))
        };
        let mut x = [1.0, 1.2];
        let status = newton2(&mut fdf, &mut x, 1e-10, 100).unwrap();
        assert_eq!(status, NewtonStatus::Success);
        assert!((x[0] - 2.0_f64.sqrt()).abs() < 1e-6);
        assert!((x[1] - 2.0_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_stepper_exponential_decay() {
        // y' = −y from 1: y(1) = e⁻¹
        let mut f = |_t: f64, y: [f64; 2]| Ok([-y[0], -y[1]]);
        let mut stepper = ImplicitStepper::new(1e-3, 1e-8);
        let mut t = 0.0;
        let mut y = [1.0, 2.0];
        while t < 1.0 {
            stepper.step(&mut f, &mut t, 1.0, &mut y).unwrap();
        }
        let e1 = (-1.0_f64).exp();
        assert!((y[0] - e1).abs() < 1e-4, "y0 = {}", y[0]);
        assert!((y[1] - 2.0 * e1).abs() < 2e-4, "y1 = {}", y[1]);
    }
}
