#![allow(dead_code)]

pub mod cache;
pub mod cluster;
pub mod signals;
pub mod strategies;

pub use cache::*;
pub use cluster::*;
pub use signals::*;

use std::time::Duration;

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
