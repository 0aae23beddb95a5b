use clap::{App, AppSettings, Arg};

pub fn parse<'a>() -> clap::ArgMatches<'a> {
    create_expected_args().get_matches()
}

pub fn create_expected_args<'a>() -> App<'a, 'a> {
    App::new("fwffm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Two-sided field-aware factorization trained with block Newton-CG")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(Arg::with_name("train_file")
            .required(true)
            .index(1)
            .value_name("train file")
            .help("User-side rows: label block followed by field:index:value features")
            .takes_value(true))
        .arg(Arg::with_name("item_file")
            .required(true)
            .index(2)
            .value_name("item file")
            .help("Item-side rows: field:index:value features")
            .takes_value(true))
        .arg(Arg::with_name("validation")
            .short("p")
            .long("validation")
            .value_name("filename")
            .help("Validation user-side rows, same format as the train file")
            .takes_value(true))
        .arg(Arg::with_name("model")
            .short("m")
            .long("model")
            .value_name("filename")
            .help("Where to write the trained model (default: <train file>.model)")
            .takes_value(true))
        .arg(Arg::with_name("lambda")
            .short("l")
            .long("lambda")
            .value_name("lambda")
            .help("Regularization coefficient")
            .takes_value(true))
        .arg(Arg::with_name("omega")
            .short("w")
            .long("omega")
            .value_name("omega")
            .help("Weight of unobserved pairs (squared loss)")
            .takes_value(true))
        .arg(Arg::with_name("r")
            .short("r")
            .long("r")
            .value_name("r")
            .help("Target value of unobserved pairs (squared loss)")
            .allow_hyphen_values(true)
            .takes_value(true))
        .arg(Arg::with_name("k")
            .short("k")
            .long("k")
            .value_name("k")
            .help("Latent dimension shared by all blocks")
            .takes_value(true))
        .arg(Arg::with_name("nr_pass")
            .short("t")
            .long("nr_pass")
            .value_name("passes")
            .help("Number of epochs over all blocks")
            .takes_value(true))
        .arg(Arg::with_name("nr_threads")
            .short("s")
            .long("nr_threads")
            .value_name("threads")
            .help("Number of worker threads")
            .takes_value(true))
        .arg(Arg::with_name("no_self_side")
            .long("no_self_side")
            .help("Do not train blocks whose two fields belong to the same side")
            .takes_value(false))
        .arg(Arg::with_name("freq")
            .long("freq")
            .help("Weight regularization of each factor row by its feature frequency")
            .takes_value(false))
        .arg(Arg::with_name("loss")
            .long("loss")
            .value_name("squared|logistic")
            .help("Loss function")
            .takes_value(true))
        .arg(Arg::with_name("seed")
            .long("seed")
            .value_name("seed")
            .help("Seed for factor initialization")
            .takes_value(true))
        .arg(Arg::with_name("top_k")
            .long("top_k")
            .value_name("k1,k2,...")
            .help("Increasing cutoffs for validation precision and nDCG")
            .takes_value(true))
        .arg(Arg::with_name("eval_every")
            .long("eval_every")
            .value_name("epochs")
            .help("Validate after the first epoch and then every this many epochs")
            .takes_value(true))
}
