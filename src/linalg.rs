//! Dense helpers over row-major `f64` buffers.
//!
//! BLAS is column-major, so every wrapper here reinterprets a row-major
//! `rows x cols` buffer as its column-major transpose and swaps operands
//! accordingly. Empty operands never reach BLAS.

use blas::*;

#[inline(always)]
pub fn inner(p: &[f64], q: &[f64]) -> f64 {
    debug_assert_eq!(p.len(), q.len());
    let mut sum = 0.0;
    for (x, y) in p.iter().zip(q.iter()) {
        sum += x * y;
    }
    sum
}

/// y += alpha * x
pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    if x.is_empty() {
        return;
    }
    unsafe {
        daxpy(x.len() as i32, alpha, x, 1, y, 1);
    }
}

/// x *= alpha
pub fn scal(alpha: f64, x: &mut [f64]) {
    if x.is_empty() {
        return;
    }
    unsafe {
        dscal(x.len() as i32, alpha, x, 1);
    }
}

pub fn dot(x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    if x.is_empty() {
        return 0.0;
    }
    unsafe { ddot(x.len() as i32, x, 1, y, 1) }
}

/// C (l x n) = A (l x k) * B (k x n) + beta * C
pub fn matmul(a: &[f64], b: &[f64], c: &mut [f64], l: usize, n: usize, k: usize, beta: f64) {
    debug_assert_eq!(a.len(), l * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(c.len(), l * n);
    if l == 0 || n == 0 {
        return;
    }
    if k == 0 {
        scal(beta, c);
        return;
    }
    unsafe {
        dgemm(
            b'N', b'N',
            n as i32, l as i32, k as i32,
            1.0,
            b, n as i32,
            a, k as i32,
            beta,
            c, n as i32,
        );
    }
}

/// C (k x k) = A^T * B, where A and B are both `rows x k`
pub fn gram(a: &[f64], b: &[f64], c: &mut [f64], rows: usize, k: usize) {
    debug_assert_eq!(a.len(), rows * k);
    debug_assert_eq!(b.len(), rows * k);
    debug_assert_eq!(c.len(), k * k);
    if k == 0 {
        return;
    }
    if rows == 0 {
        c.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    unsafe {
        dgemm(
            b'N', b'T',
            k as i32, k as i32, rows as i32,
            1.0,
            b, k as i32,
            a, k as i32,
            0.0,
            c, k as i32,
        );
    }
}

/// y (rows) = A (rows x k) * x (k) + beta * y
pub fn gemv(a: &[f64], x: &[f64], y: &mut [f64], rows: usize, k: usize, beta: f64) {
    debug_assert_eq!(a.len(), rows * k);
    debug_assert_eq!(x.len(), k);
    debug_assert_eq!(y.len(), rows);
    if rows == 0 {
        return;
    }
    if k == 0 {
        scal(beta, y);
        return;
    }
    unsafe {
        dgemv(b'T', k as i32, rows as i32, 1.0, a, k as i32, x, 1, beta, y, 1);
    }
}

/// y (k) = A^T (k x rows) * x (rows) + beta * y
pub fn gemv_t(a: &[f64], x: &[f64], y: &mut [f64], rows: usize, k: usize, beta: f64) {
    debug_assert_eq!(a.len(), rows * k);
    debug_assert_eq!(x.len(), rows);
    debug_assert_eq!(y.len(), k);
    if k == 0 {
        return;
    }
    if rows == 0 {
        scal(beta, y);
        return;
    }
    unsafe {
        dgemv(b'N', k as i32, rows as i32, 1.0, a, k as i32, x, 1, beta, y, 1);
    }
}
