//! Feeds a stream of messages into a pool of ten workers and cancels the pool
//! after two seconds.
//!
//! Run with `RUST_LOG=debug cargo run --example producer` to see worker
//! lifecycle events.

use std::{thread, time::Duration};

use fixedpool::{CancellationToken, Error, WorkerPool};
use log::{info, warn};

fn main() -> Result<(), Error> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let token = CancellationToken::new();

    let pool = WorkerPool::builder()
        .name("my-thread-pool")
        .size(10)
        .build(token.clone())?;

    {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(2));
            token.cancel();
        });
    }

    let mut submitted = 0;

    for msg in (1..=1000).map(|i| format!("Message-{}", i)) {
        let result = pool.submit_with(msg, |msg| {
            println!(">> processing {} started...", msg);
            thread::sleep(Duration::from_millis(100));
            println!(">> processing {} done", msg);
        });

        match result {
            Ok(()) => submitted += 1,
            Err(Error::PoolClosed) => {
                warn!("pool closed after {} submissions", submitted);
                break;
            }
            Err(e) => return Err(e),
        }

        // Pace the producer so cancellation lands while work is still queued.
        thread::sleep(Duration::from_millis(5));
    }

    token.wait_timeout(Duration::from_secs(5));

    info!(
        "completed {} of {} submitted tasks, {} still queued",
        pool.completed_tasks(),
        submitted,
        pool.queued_tasks()
    );

    pool.shutdown();

    Ok(())
}
