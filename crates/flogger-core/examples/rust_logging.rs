//! Example of using flogger-core directly from Rust.

use std::thread;
use std::time::Duration;

use flogger_core::{handlers, DataLogger, PoolKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Configure the logger before declaring anything
    let mut logger = DataLogger::new();
    logger.set_name("rust_benchmark")?;
    logger.set_path("./flogger-runs")?;
    logger.set_pool(PoolKind::Thread { workers: 4 })?;

    // 2. Declare entries with their handlers
    logger.declare(
        "sine",
        vec![handlers::log_info_last()],
        vec![handlers::save_to_json()],
        vec![],
    )?;
    logger.declare("cosine", vec![], vec![handlers::save_to_text()], vec![])?;

    // 3. Push values; this never blocks on the thread pool
    for i in 0..50u64 {
        logger.push("sine", (i as f64 * 0.1).sin(), Some(i))?;
        logger.push("cosine", (i as f64 * 0.1).cos(), Some(i))?;
        thread::sleep(Duration::from_millis(20));
    }

    // 4. Let the pushes land, then write everything out
    logger.wait(true);
    logger.dump();
    logger.wait(true);
    println!("Logged {} sine values", logger.entry_length("sine")?);

    Ok(())
}
