use std::error::Error;
use std::io::Error as IOError;
use std::io::ErrorKind;

use serde::{Deserialize, Serialize};

use crate::consts;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy)]
pub enum Loss {
    Squared = 1,
    Logistic = 2,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelInstance {
    pub lambda: f64,
    // weight of unobserved pairs in squared loss
    #[serde(default = "default_omega")]
    pub omega: f64,
    // target of unobserved pairs in squared loss
    #[serde(default = "default_r")]
    pub r: f64,
    pub nr_pass: u32,
    pub k: usize,
    #[serde(default = "default_usize_one")]
    pub nr_threads: usize,
    #[serde(default = "default_bool_true")]
    pub self_side: bool,
    #[serde(default = "default_bool_false")]
    pub freq: bool,
    #[serde(default = "default_loss_squared")]
    pub loss: Loss,
    #[serde(default = "default_u64_zero")]
    pub seed: u64,
    #[serde(default = "default_top_k")]
    pub top_k: Vec<usize>,
    #[serde(default = "default_eval_every")]
    pub eval_every: u32,
}

fn default_omega() -> f64 {0.1}
fn default_r() -> f64 {-1.0}
fn default_usize_one() -> usize {1}
fn default_bool_true() -> bool {true}
fn default_bool_false() -> bool {false}
fn default_loss_squared() -> Loss {Loss::Squared}
fn default_u64_zero() -> u64 {0}
fn default_top_k() -> Vec<usize> {consts::DEFAULT_TOP_K.to_vec()}
fn default_eval_every() -> u32 {5}

fn parse_top_k(s: &str) -> Result<Vec<usize>, Box<dyn Error>> {
    let mut top_k: Vec<usize> = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        top_k.push(part.parse().map_err(|_| {
            IOError::new(ErrorKind::Other, format!("--top_k expects comma separated integers, got: \"{}\"", s))
        })?);
    }
    Ok(top_k)
}

impl ModelInstance {
    pub fn new_empty() -> Result<ModelInstance, Box<dyn Error>> {
        let mi = ModelInstance {
            lambda: 1e-5,
            omega: default_omega(),
            r: default_r(),
            nr_pass: 20,
            k: 4,
            nr_threads: 1,
            self_side: true,
            freq: false,
            loss: Loss::Squared,
            seed: 0,
            top_k: default_top_k(),
            eval_every: default_eval_every(),
        };
        Ok(mi)
    }

    pub fn new_from_cmdline<'a>(cl: &clap::ArgMatches<'a>) -> Result<ModelInstance, Box<dyn Error>> {
        let mut mi = ModelInstance::new_empty()?;

        if let Some(val) = cl.value_of("lambda") {
            mi.lambda = val.parse()?;
        }
        if let Some(val) = cl.value_of("omega") {
            mi.omega = val.parse()?;
        }
        if let Some(val) = cl.value_of("r") {
            mi.r = val.parse()?;
        }
        if let Some(val) = cl.value_of("k") {
            mi.k = val.parse()?;
        }
        if let Some(val) = cl.value_of("nr_pass") {
            mi.nr_pass = val.parse()?;
        }
        if let Some(val) = cl.value_of("nr_threads") {
            mi.nr_threads = val.parse()?;
        }
        if cl.is_present("no_self_side") {
            mi.self_side = false;
        }
        if cl.is_present("freq") {
            mi.freq = true;
        }
        if let Some(val) = cl.value_of("loss") {
            mi.loss = match val {
                "squared" => Loss::Squared,
                "logistic" => Loss::Logistic,
                _ => return Err(Box::new(IOError::new(ErrorKind::Other, format!("--loss must be \"squared\" or \"logistic\", got: \"{}\"", val)))),
            };
        }
        if let Some(val) = cl.value_of("seed") {
            mi.seed = val.parse()?;
        }
        if let Some(val) = cl.value_of("top_k") {
            mi.top_k = parse_top_k(val)?;
        }
        if let Some(val) = cl.value_of("eval_every") {
            mi.eval_every = val.parse()?;
        }

        mi.validate()?;
        Ok(mi)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.k == 0 {
            return Err("k has to be at least 1")?;
        }
        if !(self.lambda >= 0.0) {
            return Err(format!("lambda has to be non-negative, passed: {}", self.lambda))?;
        }
        if !(self.omega >= 0.0 && self.omega <= 1.0) {
            return Err(format!("omega has to be within [0, 1], passed: {}", self.omega))?;
        }
        if self.nr_threads == 0 {
            return Err("nr_threads has to be at least 1")?;
        }
        if self.top_k.is_empty() || self.top_k.iter().any(|&k| k == 0) {
            return Err(format!("top_k needs at least one cutoff and no zero cutoffs, passed: {:?}", self.top_k))?;
        }
        if self.top_k.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!("top_k cutoffs have to be strictly increasing, passed: {:?}", self.top_k))?;
        }
        if self.eval_every == 0 {
            return Err("eval_every has to be at least 1")?;
        }
        Ok(())
    }
}
