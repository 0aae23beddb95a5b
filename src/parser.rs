use std::error::Error;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::Error as IOError;
use std::io::ErrorKind;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::feature_store::Node;

/// Rows of one input file: sparse features, and for label files the labelled item rows
#[derive(Debug, Default)]
pub struct ParsedRows {
    pub features: Vec<Vec<Node>>,
    pub labels: Vec<Vec<(usize, f64)>>,
    // one past the largest field id seen
    pub nr_fields: usize,
}

pub fn create_buffered_input(input_filename: &str) -> Result<Box<dyn BufRead>, Box<dyn Error>> {
    // Handler for different (or no) compression types
    let input = File::open(input_filename)
        .map_err(|e| IOError::new(e.kind(), format!("Could not open {}: {}", input_filename, e)))?;
    let input_format = Path::new(input_filename).extension().and_then(|ext| ext.to_str());
    match input_format {
        Some("gz") => {
            let gz_decoder = MultiGzDecoder::new(input);
            Ok(Box::new(io::BufReader::new(gz_decoder)))
        }
        Some("zst") => {
            let zstd_decoder = ZstdDecoder::new(input)?;
            Ok(Box::new(io::BufReader::new(zstd_decoder)))
        }
        _ => Ok(Box::new(io::BufReader::new(input))),
    }
}

fn malformed(source: &str, line_nr: usize, msg: String) -> Box<dyn Error> {
    Box::new(IOError::new(
        ErrorKind::InvalidData,
        format!("{} line {}: {}", source, line_nr, msg),
    ))
}

/// `j` or `j:y` entries separated by commas, `-` for none. `y > 0` is positive.
fn parse_labels(block: &str, source: &str, line_nr: usize) -> Result<Vec<(usize, f64)>, Box<dyn Error>> {
    if block == "-" {
        return Ok(Vec::new());
    }
    let mut labels = Vec::new();
    for entry in block.split(',') {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, ':');
        let target = parts.next().unwrap_or("");
        let j: usize = target
            .parse()
            .map_err(|_| malformed(source, line_nr, format!("label target \"{}\" is not an index", target)))?;
        let y: f64 = match parts.next() {
            Some(value) => value
                .parse()
                .map_err(|_| malformed(source, line_nr, format!("label value \"{}\" is not a number", value)))?,
            None => 1.0,
        };
        labels.push((j, if y > 0.0 { 1.0 } else { -1.0 }));
    }
    Ok(labels)
}

fn parse_feature(token: &str, source: &str, line_nr: usize) -> Result<Node, Box<dyn Error>> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 3 {
        return Err(malformed(source, line_nr, format!("expected field:index:value, got \"{}\"", token)));
    }
    let bad = |what: &str| malformed(source, line_nr, format!("bad {} in \"{}\"", what, token));
    Ok(Node {
        fid: parts[0].parse().map_err(|_| bad("field"))?,
        idx: parts[1].parse().map_err(|_| bad("index"))?,
        val: parts[2].parse().map_err(|_| bad("value"))?,
    })
}

/// Reads one row per line. With `with_labels` every line starts with a label block.
pub fn read_rows(input: &mut dyn BufRead, with_labels: bool, source: &str) -> Result<ParsedRows, Box<dyn Error>> {
    let mut parsed = ParsedRows::default();
    for (nr, line) in input.lines().enumerate() {
        let line = line?;
        let line_nr = nr + 1;
        let mut tokens = line.split_whitespace();
        if with_labels {
            let labels = match tokens.next() {
                Some(block) => parse_labels(block, source, line_nr)?,
                None => Vec::new(),
            };
            parsed.labels.push(labels);
        }
        let mut row = Vec::new();
        for token in tokens {
            let node = parse_feature(token, source, line_nr)?;
            parsed.nr_fields = parsed.nr_fields.max(node.fid + 1);
            row.push(node);
        }
        parsed.features.push(row);
    }
    Ok(parsed)
}

pub fn read_file(filename: &str, with_labels: bool) -> Result<ParsedRows, Box<dyn Error>> {
    let mut input = create_buffered_input(filename)?;
    let parsed = read_rows(&mut input, with_labels, filename)?;
    log::info!(
        "Read {} rows with {} fields from {}",
        parsed.features.len(),
        parsed.nr_fields,
        filename
    );
    Ok(parsed)
}
