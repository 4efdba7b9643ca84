// keyed_pool demo binary
// The library lives in lib.rs; run with `cargo run --features cli` and
// RUST_LOG=keyed_pool=debug to see connections being created, reused and recycled.

use keyed_pool::{PoolConfiguration, ReentrantPool};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== keyed_pool ===");

    let config = PoolConfiguration::new()
        .with_size(2)
        .with_timeout(Duration::from_millis(500));
    let pool = ReentrantPool::new(config, |(host, port): &(&str, u16)| format!("{}:{}", host, port));

    for host in ["a.example", "b.example", "a.example", "c.example", "a.example"] {
        let used = pool.with_mut(&(host, 80), |conn| {
            conn.push('*');
            conn.clone()
        });
        match used {
            Ok(conn) => println!("  used {}", conn),
            Err(err) => println!("  {} failed: {}", host, err),
        }
    }

    let metrics = pool.metrics();
    println!("  created: {}, recycled: {}", metrics.created, metrics.recycled);

    let closed = pool.try_shutdown(|conn: String| {
        println!("  closing {}", conn);
        if conn.is_empty() { Err("connection without address") } else { Ok(()) }
    });
    if let Err(err) = closed {
        println!("  shutdown: {}", err);
    }
}
