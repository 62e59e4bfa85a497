use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::debug;

/// Reads stdin on a dedicated thread and forwards each line.
///
/// A pending read on tokio's stdin holds up runtime shutdown, so interactive
/// input lives on a plain thread that the process can abandon on exit. The
/// channel closes when stdin reaches EOF.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });
    rx
}
