use std::error::Error;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::evaluator::Evaluator;
use crate::feature_store::FeatureStore;
use crate::interactions::InteractionIndex;
use crate::model_instance::ModelInstance;
use crate::parser;
use crate::problem::Problem;

/// Input files of one training run
pub struct TrainingFiles<'a> {
    pub train: &'a str,
    pub items: &'a str,
    pub validation: Option<&'a str>,
}

/// Validation rows are projected with the training cardinalities; their
/// edges are indexed against the training item set.
fn load_evaluator(
    mi: &ModelInstance,
    filename: &str,
    user: &FeatureStore,
    train_index: &InteractionIndex,
) -> Result<Evaluator, Box<dyn Error>> {
    let parsed = parser::read_file(filename, true)?;
    let users = FeatureStore::new(&parsed.features, user.nr_fields(), Some(user.dims()))?;
    let index = InteractionIndex::new(&parsed.labels, train_index.n);
    log::info!(
        "Validation: {} rows, {} positive edges",
        users.m,
        index.nr_positives()
    );
    Ok(Evaluator::new(
        users,
        index,
        train_index.column_popularity(),
        mi.top_k.clone(),
    ))
}

/// Reads all inputs and builds an initialized problem
pub fn load_problem(mi: &ModelInstance, files: &TrainingFiles) -> Result<Problem, Box<dyn Error>> {
    let train = parser::read_file(files.train, true)?;
    let items = parser::read_file(files.items, false)?;
    let user = FeatureStore::new(&train.features, train.nr_fields, None)?;
    let item = FeatureStore::new(&items.features, items.nr_fields, None)?;
    let index = InteractionIndex::new(&train.labels, item.m);
    let evaluator = match files.validation {
        Some(filename) => Some(load_evaluator(mi, filename, &user, &index)?),
        None => None,
    };
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(mi.seed);
    Problem::init(mi, user, item, index, evaluator, &mut rng)
}
