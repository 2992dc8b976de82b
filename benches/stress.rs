use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, db: &str, user: &str) -> Client {
    let password = std::env::var("RENTD_PASSWORD").unwrap_or_else(|_| "rentd".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_db() -> String {
    format!("bench_{}", Ulid::new())
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() + Days::new(offset)
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

async fn create_item(client: &Client, total_stock: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, price_per_day, total_stock) VALUES ('{id}', 'Bench item', 1000, {total_stock})"
        ))
        .await
        .unwrap();
    id
}

fn rental_sql(item: Ulid, start: NaiveDate, end: NaiveDate, quantity: u32) -> String {
    format!(
        "INSERT INTO rentals (id, item_id, start_date, end_date, quantity) VALUES ('{}', '{item}', '{start}', '{end}', {quantity})",
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let db = fresh_db();
    let owner = connect(host, port, &db, "owner").await;
    let renter = connect(host, port, &db, "renter").await;
    let item = create_item(&owner, 1).await;

    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    // Two-day rentals back to back, never overlapping.
    for i in 0..n {
        let t = Instant::now();
        renter
            .batch_execute(&rental_sql(item, day(i * 2), day(i * 2 + 1), 1))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} rentals in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(host: &str, port: u16) {
    let db = fresh_db();
    let owner = connect(host, port, &db, "owner").await;
    let stock = 25;
    let item = create_item(&owner, stock).await;

    let n_tasks = 20;
    let n_per_task = 50;
    let accepted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let accepted = accepted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &format!("renter{t}")).await;
            // Every request covers day 10, so all of them compete for the same units.
            for j in 0..n_per_task {
                let s = day(j % 10);
                if client.batch_execute(&rental_sql(item, s, day(10), 1)).await.is_ok() {
                    accepted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ok = accepted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_per_task} requests = {total} total in {:.2}s, {ok} accepted (stock {stock})",
        elapsed.as_secs_f64()
    );
    assert_eq!(ok, stock as usize, "capacity gate let through the wrong number of rentals");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = fresh_db();
    let owner = connect(host, port, &db, "owner").await;

    let mut items = Vec::new();
    for _ in 0..50 {
        items.push(create_item(&owner, 10).await);
    }
    for (i, item) in items.iter().enumerate() {
        for k in 0..20u64 {
            let s = day(k * 3 + i as u64 % 3);
            owner
                .batch_execute(&rental_sql(*item, s, s + Days::new(2), 1))
                .await
                .unwrap();
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        let item = items[w as usize];
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &format!("writer{w}")).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let s = day(1000 + w * 10_000 + i * 2);
                let _ = client.batch_execute(&rental_sql(item, s, s + Days::new(1), 1)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        let item = items[r % items.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, "reader").await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                let sql = if i % 2 == 0 {
                    format!(
                        r#"SELECT * FROM availability WHERE item_id = '{item}' AND start >= '{}' AND "end" <= '{}'"#,
                        day(0),
                        day(30)
                    )
                } else {
                    format!(
                        r#"SELECT * FROM items WHERE start >= '{}' AND "end" <= '{}' LIMIT 20"#,
                        day(5),
                        day(9)
                    )
                };
                client.simple_query(&sql).await.unwrap();
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

    print_latency("availability/listing query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10u64;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_db(), &format!("user{c}")).await;
            let item = create_item(&client, 10).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&rental_sql(item, day(i * 2), day(i * 2 + 1), 1))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RENTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RENTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RENTD_PORT");

    println!("=== rentd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential rental throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended rentals on one item");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
