#![allow(dead_code)]

use fedlock_client::Client;
use fedlock_core::{LockMode, LockTarget, Result};
use fedlock_daemon::{open_manager, serve};
use fedlock_tests::{base_url, sample_config};
use std::time::Duration;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start a daemon on `addr` and return a client talking to it.
pub async fn start(addr: &'static str) -> Client {
    let manager = open_manager(&sample_config().unwrap()).unwrap();
    let socket = addr.parse().unwrap();
    tokio::spawn(async move {
        serve(manager, socket).await;
    });
    // wait for the daemon to start
    tokio::time::sleep(Duration::from_millis(300)).await;
    Client::new(&base_url(addr))
}

/// Ask again until the lock is granted or `rounds` attempts are used up.
pub async fn lock_eventually(
    client: &Client,
    txn_id: u64,
    target: &LockTarget,
    mode: LockMode,
    rounds: usize,
) -> Result<bool> {
    for _ in 0..rounds {
        if client.lock(txn_id, target, mode).await? {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}
