//! Ctrl+C handling. First press starts a graceful shutdown (workers stop
//! leasing, in-flight fetches abort, an emergency checkpoint is written
//! by the run loop); second press exits immediately.

use tokio_util::sync::CancellationToken;

pub fn setup_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nReceived Ctrl+C, initiating graceful shutdown...");
            println!("Press Ctrl+C again to force quit");
            // Idempotent: a second call from elsewhere is a no-op.
            cancel.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nForce quit requested, exiting immediately...");
                std::process::exit(1);
            }
        }
    });
}
