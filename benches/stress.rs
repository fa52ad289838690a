use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

struct Target {
    host: String,
    port: u16,
    db: String,
    password: String,
    admin: String,
    admin_password: String,
}

async fn connect(target: &Target, user: &str) -> Client {
    let password = if user == target.admin {
        &target.admin_password
    } else {
        &target.password
    };
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(&target.db)
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

fn first_value(messages: &[SimpleQueryMessage], column: &str) -> Option<String> {
    messages.iter().find_map(|m| match m {
        SimpleQueryMessage::Row(row) => row.get(column).map(str::to_string),
        _ => None,
    })
}

async fn create_lot(admin: &Client, capacity: u32) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO lots (id, name, price, capacity) VALUES ('{id}', 'Bench', 4.00, {capacity})"
        ))
        .await
        .unwrap();
    id
}

/// Allocate then release once. `None` when the lot was full.
async fn park_once(client: &Client, lot: Ulid) -> Option<()> {
    let taken = client
        .simple_query(&format!(
            "INSERT INTO reservations (lot_id) VALUES ('{lot}') RETURNING *"
        ))
        .await
        .ok()?;
    let rid = first_value(&taken, "id")?;
    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap();
    Some(())
}

async fn phase1_sequential(target: &Target) {
    let admin = connect(target, &target.admin).await;
    let lot = create_lot(&admin, 10).await;
    let client = connect(target, "seq_driver").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        park_once(&client, lot).await.expect("lot unexpectedly full");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} park/leave cycles in {:.2}s = {ops:.0} cycles/sec", elapsed.as_secs_f64());
    print_latency("cycle latency", &mut latencies);
}

async fn phase2_contention(target: &Arc<Target>) {
    let admin = connect(target, &target.admin).await;
    let capacity = 8;
    let lot = create_lot(&admin, capacity).await;

    let n_tasks = 32;
    let n_per_task = 100;
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let target = target.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &format!("driver{i}")).await;
            for _ in 0..n_per_task {
                if park_once(&client, lot).await.is_none() {
                    refused.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let refused = refused.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} drivers x {n_per_task} attempts on {capacity} spots: {} parked, {refused} turned away in {:.2}s",
        total - refused,
        elapsed.as_secs_f64()
    );

    let lots = admin
        .simple_query(&format!("SELECT * FROM lots WHERE id = '{lot}'"))
        .await
        .unwrap();
    let available = first_value(&lots, "available").unwrap_or_default();
    assert_eq!(available, capacity.to_string(), "ledger drifted under contention");
    println!("  ledger check: available={available} capacity={capacity}");
}

async fn phase3_read_under_load(target: &Arc<Target>) {
    let admin = connect(target, &target.admin).await;
    let lot = create_lot(&admin, 50).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target, &format!("writer{w}")).await;
            while !stop.load(Ordering::Relaxed) {
                let _ = park_once(&client, lot).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target, &format!("reader{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM spots WHERE lot_id = '{lot}'"))
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

    print_latency("spot listing", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Arc<Target>) {
    let admin = connect(target, &target.admin).await;
    let lot = create_lot(&admin, 100).await;

    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for c in 0..n_conns {
        let target = target.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &format!("storm{c}")).await;
            for _ in 0..ops_per_conn {
                park_once(&client, lot).await.expect("lot unexpectedly full");
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
        "  {n_conns} connections, {ops_per_conn} cycles each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Arc::new(Target {
        host: std::env::var("PARKD_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("PARKD_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid PARKD_PORT"),
        db: format!("bench_{}", Ulid::new()),
        password: std::env::var("PARKD_PASSWORD").unwrap_or_else(|_| "parkd".into()),
        admin: std::env::var("PARKD_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
        admin_password: std::env::var("PARKD_ADMIN_PASSWORD")
            .unwrap_or_else(|_| "parkd-admin".into()),
    });

    println!("=== parkd stress benchmark ===");
    println!("target: {}:{} (tenant {})\n", target.host, target.port, target.db);

    println!("[phase 1] sequential park/leave throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contention on a small lot");
    phase2_contention(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== done ===");
}
