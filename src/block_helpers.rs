use std::error::Error;

#[macro_export]
macro_rules! assert_epsilon {
    ($x:expr, $y:expr) => {
        let x = $x; // Make sure we evaluate only once
        let y = $y;
        if !(x - y < 0.000005 && y - x < 0.000005) {
            println!("Expectation: {}, Got: {}", y, x);
            panic!();
        }
    };
}

/// One row of a row-major `rows x k` buffer
#[inline(always)]
pub fn row(buf: &[f64], i: usize, k: usize) -> &[f64] {
    &buf[i * k..(i + 1) * k]
}

#[inline(always)]
pub fn row_mut(buf: &mut [f64], i: usize, k: usize) -> &mut [f64] {
    &mut buf[i * k..(i + 1) * k]
}

/// Writes `rows x k` floats, one line per row, each line prefixed by `tag` and the row number
pub fn write_rows(
    tag: &str,
    buf: &[f64],
    k: usize,
    output_bufwriter: &mut dyn std::io::Write,
) -> Result<(), Box<dyn Error>> {
    if k == 0 {
        return Ok(());
    }
    for (i, r) in buf.chunks(k).enumerate() {
        write!(output_bufwriter, "{} {}", tag, i)?;
        for v in r {
            write!(output_bufwriter, " {}", v)?;
        }
        writeln!(output_bufwriter)?;
    }
    Ok(())
}
