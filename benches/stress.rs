use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

fn date(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .and_then(|base| base.checked_add_days(Days::new(offset)))
        .expect("date in range")
}

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("ratebook")
        .user("ratebook")
        .password(std::env::var("RATEBOOK_PASSWORD").unwrap_or_else(|_| "ratebook".into()));

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

fn insert_sql(unit: Ulid, from: NaiveDate, to: NaiveDate, value: f64) -> String {
    let booked = date(0);
    format!(
        "INSERT INTO rates (unit_id, stay_from, stay_to, nights, value, book_from) \
         VALUES ('{unit}', '{from}', '{to}', 1, {value}, '{booked}')"
    )
}

fn quote_sql(unit: Ulid, arrival: NaiveDate, departure: NaiveDate) -> String {
    let booked = date(0);
    format!(
        "SELECT * FROM quote WHERE unit_id = '{unit}' AND arrival = '{arrival}' \
         AND departure = '{departure}' AND booking_date = '{booked}'"
    )
}

/// Disjoint weekly rates, alternating values so nothing merges.
async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let unit = Ulid::new();

    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let from = date(i * 7);
        let to = date(i * 7 + 6);
        let value = 100.0 + (i % 2) as f64;
        let t = Instant::now();
        client.batch_execute(&insert_sql(unit, from, to, value)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} rates in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every insert lands inside an existing rate and splits it.
async fn phase2_splits(host: &str, port: u16) {
    let client = connect(host, port).await;
    let unit = Ulid::new();
    client
        .batch_execute(&insert_sql(unit, date(0), date(3650), 100.0))
        .await
        .unwrap();

    let n = 500u64;
    let mut latencies = Vec::with_capacity(n as usize);
    for i in 0..n {
        let from = date(i * 7 + 1);
        let to = date(i * 7 + 3);
        let t = Instant::now();
        client
            .batch_execute(&insert_sql(unit, from, to, 150.0 + i as f64))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("split insert latency", &mut latencies);
}

async fn phase3_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            // one unit per task, so tasks never share a lock
            let unit = Ulid::new();
            for j in 0..n_per_task {
                let value = 100.0 + (j % 2) as f64;
                client
                    .batch_execute(&insert_sql(unit, date(j * 3), date(j * 3 + 2), value))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} rates = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_quotes_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let unit = Ulid::new();
    for i in 0..365u64 {
        setup
            .batch_execute(&insert_sql(unit, date(i), date(i), 100.0 + (i % 2) as f64))
            .await
            .unwrap();
    }
    drop(setup);

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let wunit = Ulid::new();
            let mut i = 0u64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let value = 100.0 + (i % 2) as f64;
                let _ = client
                    .batch_execute(&insert_sql(wunit, date(i * 2), date(i * 2 + 1), value))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500u64;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader as usize);
            for i in 0..reads_per_reader {
                let arrival = date((i + r) % 300);
                let departure = date((i + r) % 300 + 14);
                let t = Instant::now();
                client.simple_query(&quote_sql(unit, arrival, departure)).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("quote latency", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RATEBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RATEBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RATEBOOK_PORT");

    println!("=== ratebook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] splitting inserts");
    phase2_splits(&host, port).await;

    println!("\n[phase 3] concurrent write throughput");
    phase3_concurrent(&host, port).await;

    println!("\n[phase 4] quote latency under write load");
    phase4_quotes_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
