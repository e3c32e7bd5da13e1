use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

/// Connect to a fresh organization, or to `org` when given.
async fn connect(host: &str, port: u16, org: Option<&str>) -> Client {
    let dbname = org.map_or_else(|| format!("bench_{}", Ulid::new()), str::to_string);
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(&dbname)
        .user("bookd")
        .password("bookd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_resource(client: &Client, capacity: Option<u32>) -> Ulid {
    let rid = Ulid::new();
    let capacity = capacity.map_or("NULL".to_string(), |c| c.to_string());
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, capacity) VALUES ('{rid}', 'bench', {capacity})"
        ))
        .await
        .unwrap();
    rid
}

fn booking_sql(rid: Ulid, start: i64, end: i64) -> String {
    let bid = Ulid::new();
    format!(r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{rid}', {start}, {end})"#)
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, None).await;
    let rid = create_resource(&client, Some(1)).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        // Gaps of one hour keep closed spans from touching.
        let s = (i as i64) * 2 * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(rid, s, s + HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients racing for the same slot. Exactly `capacity` may win.
async fn phase2_contention(host: &str, port: u16) {
    let org = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, Some(&org)).await;

    let rounds = 50;
    let n_clients = 20;
    let capacity = 3usize;
    let mut violations = 0;
    let start = Instant::now();

    let mut clients = Vec::with_capacity(n_clients);
    for _ in 0..n_clients {
        clients.push(Arc::new(connect(host, port, Some(&org)).await));
    }

    for round in 0..rounds {
        let rid = create_resource(&setup, Some(capacity as u32)).await;
        let s = (round as i64) * HOUR;
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for client in &clients {
            let client = client.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                if client.batch_execute(&booking_sql(rid, s, s + HOUR)).await.is_ok() {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        if admitted.load(Ordering::Relaxed) != capacity {
            violations += 1;
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {n_clients} clients (capacity {capacity}) in {:.2}s, {violations} rounds with wrong admission count",
        elapsed.as_secs_f64()
    );
}

async fn phase3_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task uses its own organization
            let client = connect(&host, port, None).await;
            let rid = create_resource(&client, Some(5)).await;
            for j in 0..n_per_task {
                let s = (j as i64) * HOUR;
                client
                    .batch_execute(&booking_sql(rid, s, s + HOUR / 2))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_read_under_load(host: &str, port: u16) {
    let org = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, Some(&org)).await;
    let read_rid = create_resource(&setup, Some(10)).await;
    for i in 0..200 {
        let s = (i as i64) * HOUR;
        setup
            .batch_execute(&booking_sql(read_rid, s, s + HOUR / 2))
            .await
            .unwrap();
    }
    let block = Ulid::new();
    setup
        .batch_execute(&format!(
            r#"INSERT INTO unavailabilities (id, resource_id, start, "end") VALUES ('{block}', '{read_rid}', {}, {})"#,
            300 * HOUR,
            310 * HOUR
        ))
        .await
        .unwrap();

    // Writers hit other resources of the same organization.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let org = org.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, Some(&org)).await;
            let rid = create_resource(&client, Some(10)).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = i * 2 * HOUR;
                let _ = client.batch_execute(&booking_sql(rid, s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        let org = org.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, Some(&org)).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM availability WHERE resource_id = '{read_rid}' AND start >= 0 AND "end" <= {}"#,
                        365 * 24 * HOUR
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("BOOKD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("BOOKD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid BOOKD_PORT");

    println!("=== bookd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] admission under contention");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] concurrent write throughput");
    phase3_concurrent(&host, port).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
