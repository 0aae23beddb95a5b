use std::error::Error;
use std::fs;
use std::io;
use std::io::BufRead;
use std::io::Error as IOError;
use std::io::ErrorKind;
use std::io::Write;

use crate::block_helpers::write_rows;
use crate::blocks::Block;
use crate::field_pairs::FieldSpace;
use crate::problem::Problem;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelHeader {
    pub f: usize,
    pub fu: usize,
    pub fv: usize,
    pub k: usize,
    // cardinality of every field, users first
    pub dims: Vec<usize>,
}

/// Factor matrices of one block as read back from a model file
#[derive(Clone, Debug, PartialEq)]
pub struct BlockFactors {
    pub f1: usize,
    pub f2: usize,
    pub w: Vec<f64>,
    pub h: Vec<f64>,
}

pub fn save_model_to_filename(filename: &str, problem: &Problem) -> Result<(), Box<dyn Error>> {
    let mut output_bufwriter = io::BufWriter::new(fs::File::create(filename)?);
    write_model(&mut output_bufwriter, &problem.header(), problem.blocks())?;
    output_bufwriter.flush()?;
    log::info!("Model written to {}", filename);
    Ok(())
}

pub fn write_model(
    output_bufwriter: &mut dyn io::Write,
    header: &ModelHeader,
    blocks: &[Block],
) -> Result<(), Box<dyn Error>> {
    writeln!(output_bufwriter, "f {}", header.f)?;
    writeln!(output_bufwriter, "fu {}", header.fu)?;
    writeln!(output_bufwriter, "fv {}", header.fv)?;
    writeln!(output_bufwriter, "k {}", header.k)?;
    write!(output_bufwriter, "d")?;
    for d in header.dims.iter() {
        write!(output_bufwriter, " {}", d)?;
    }
    writeln!(output_bufwriter)?;
    for block in blocks {
        write_rows(&format!("W {} {}", block.f1, block.f2), &block.w, header.k, output_bufwriter)?;
        write_rows(&format!("H {} {}", block.f1, block.f2), &block.h, header.k, output_bufwriter)?;
    }
    Ok(())
}

pub fn load_model_from_filename(filename: &str) -> Result<(ModelHeader, Vec<BlockFactors>), Box<dyn Error>> {
    let mut input_bufreader = io::BufReader::new(fs::File::open(filename)?);
    read_model(&mut input_bufreader)
}

fn malformed(line_nr: usize, msg: &str) -> Box<dyn Error> {
    Box::new(IOError::new(
        ErrorKind::InvalidData,
        format!("Model file line {}: {}", line_nr, msg),
    ))
}

fn header_value(line: Option<(usize, String)>, key: &str) -> Result<usize, Box<dyn Error>> {
    let (line_nr, line) = line.ok_or_else(|| malformed(0, &format!("missing \"{}\" header", key)))?;
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some(key) {
        return Err(malformed(line_nr, &format!("expected \"{}\" header", key)));
    }
    let value = tokens
        .next()
        .ok_or_else(|| malformed(line_nr, "missing value"))?
        .parse()?;
    Ok(value)
}

pub fn read_model(input_bufreader: &mut dyn BufRead) -> Result<(ModelHeader, Vec<BlockFactors>), Box<dyn Error>> {
    let mut lines = Vec::new();
    for (nr, line) in input_bufreader.lines().enumerate() {
        lines.push((nr + 1, line?));
    }
    let mut lines = lines.into_iter();

    let f = header_value(lines.next(), "f")?;
    let fu = header_value(lines.next(), "fu")?;
    let fv = header_value(lines.next(), "fv")?;
    let k = header_value(lines.next(), "k")?;
    if fu + fv != f {
        return Err(malformed(2, &format!("fu + fv = {} does not match f = {}", fu + fv, f)));
    }
    let (line_nr, line) = lines.next().ok_or_else(|| malformed(5, "missing \"d\" header"))?;
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("d") {
        return Err(malformed(line_nr, "expected \"d\" header"));
    }
    let dims = tokens.map(|t| t.parse::<usize>()).collect::<Result<Vec<usize>, _>>()?;
    if dims.len() != f {
        return Err(malformed(line_nr, &format!("expected {} cardinalities, got {}", f, dims.len())));
    }

    let space = FieldSpace::new(fu, fv);
    let mut blocks: Vec<BlockFactors> = (0..space.nr_blocks())
        .map(|slot| {
            let (f1, f2) = space.pair(slot);
            BlockFactors {
                f1,
                f2,
                w: Vec::with_capacity(dims[f1] * k),
                h: Vec::with_capacity(dims[f2] * k),
            }
        })
        .collect();

    for (line_nr, line) in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 4 + k {
            return Err(malformed(line_nr, &format!("expected {} tokens, got {}", 4 + k, tokens.len())));
        }
        let f1: usize = tokens[1].parse()?;
        let f2: usize = tokens[2].parse()?;
        let row: usize = tokens[3].parse()?;
        if f1 > f2 || f2 >= f {
            return Err(malformed(line_nr, &format!("no block ({}, {})", f1, f2)));
        }
        let block = &mut blocks[space.slot(f1, f2)];
        let (matrix, field) = match tokens[0] {
            "W" => (&mut block.w, f1),
            "H" => (&mut block.h, f2),
            other => return Err(malformed(line_nr, &format!("unknown tag \"{}\"", other))),
        };
        if row != matrix.len() / k.max(1) || row >= dims[field] {
            return Err(malformed(line_nr, &format!("unexpected row {}", row)));
        }
        for t in &tokens[4..] {
            matrix.push(t.parse()?);
        }
    }

    for block in blocks.iter() {
        if block.w.len() != dims[block.f1] * k || block.h.len() != dims[block.f2] * k {
            return Err(Box::new(IOError::new(
                ErrorKind::InvalidData,
                format!("Model file is missing rows of block ({}, {})", block.f1, block.f2),
            )));
        }
    }

    Ok((ModelHeader { f, fu, fv, k, dims }, blocks))
}
