use std::error::Error;
use std::time::Instant;

use fwffm::model_instance::ModelInstance;
use fwffm::multithread_helpers::build_thread_pool;
use fwffm::persistence::save_model_to_filename;
use fwffm::trainer::{load_problem, TrainingFiles};
use fwffm::{cmdline, logging_layer};

fn main() {
    logging_layer::initialize_logging_layer();

    if let Err(e) = main_fw_loop() {
        log::error!("Global error: {:?}", e);
        std::process::exit(1)
    }
}

fn main_fw_loop() -> Result<(), Box<dyn Error>> {
    // We'll parse once the command line into cl and then different objects will examine it
    let cl = cmdline::parse();
    let mi = ModelInstance::new_from_cmdline(&cl)?;
    log::info!("Model instance: {}", serde_json::to_string(&mi)?);

    let train_filename = cl.value_of("train_file").ok_or("train file expected")?;
    let files = TrainingFiles {
        train: train_filename,
        items: cl.value_of("item_file").ok_or("item file expected")?,
        validation: cl.value_of("validation"),
    };
    let model_filename = match cl.value_of("model") {
        Some(filename) => filename.to_string(),
        None => format!("{}.model", train_filename),
    };

    let pool = build_thread_pool(mi.nr_threads)?;
    let now = Instant::now();
    // the pool needs a Send error type back
    let problem = pool.install(|| {
        let mut problem = load_problem(&mi, &files).map_err(|e| e.to_string())?;
        problem.solve();
        Ok::<_, String>(problem)
    })?;
    log::info!("Training finished in {:.2?}", now.elapsed());

    save_model_to_filename(&model_filename, &problem)?;
    Ok(())
}
