//! Several worker threads sharing one keyed pool of "connections"

use keyed_pool::{MetricsExporter, PoolConfiguration, PoolError, ReentrantPool};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct HttpConnection {
    host: String,
    port: u16,
    requests: usize,
}

impl HttpConnection {
    fn get(&mut self, path: &str) -> String {
        self.requests += 1;
        thread::sleep(Duration::from_millis(5));
        format!(
            "GET http://{}:{}{} (request #{} on this connection)",
            self.host, self.port, path, self.requests
        )
    }
}

fn main() {
    println!("=== keyed_pool - Shared Hosts ===\n");

    let config = PoolConfiguration::new()
        .with_size(3)
        .with_timeout(Duration::from_secs(2));
    let pool = ReentrantPool::new(config, |(host, port): &(String, u16)| HttpConnection {
        host: host.clone(),
        port: *port,
        requests: 0,
    });

    let hosts = ["api.example", "cdn.example", "auth.example", "db.example"];

    thread::scope(|s| {
        for (worker, host) in hosts.iter().cycle().take(12).enumerate() {
            let pool = &pool;
            s.spawn(move || {
                let key = (host.to_string(), 80);
                match pool.with_mut(&key, |conn| conn.get(&format!("/worker/{}", worker))) {
                    Ok(line) => println!("   {}", line),
                    Err(PoolError::Timeout(waited)) => println!("   worker {} gave up after {:?}", worker, waited),
                    Err(err) => println!("   worker {} failed: {}", worker, err),
                }
            });
        }
    });

    // Nested use on one thread shares the outer connection.
    pool.with(&("api.example".to_string(), 80), |outer| {
        let inner = pool.with(&("other.example".to_string(), 443), |inner| inner.host.clone());
        println!("\n   nested checkout reused {} (asked for other.example): {:?}", outer.host, inner);
    })
    .unwrap();

    println!("\n{}", MetricsExporter::export_prometheus(&pool.metrics(), "http", None));

    pool.shutdown(|conn| println!("   closing {}:{} after {} requests", conn.host, conn.port, conn.requests));
}
