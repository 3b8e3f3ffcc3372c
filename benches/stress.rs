use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("bench")
        .password("fleetline");

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn register_vehicle(client: &Client) -> Ulid {
    let vid = Ulid::new();
    let plate = format!("BX{}", &vid.to_string()[20..]);
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, admin_org_id, plate) VALUES ('{vid}', '{}', '{plate}')",
            Ulid::new()
        ))
        .await
        .unwrap();
    vid
}

/// Back-to-back one-hour assignments starting tomorrow.
async fn assign_slot(client: &Client, vid: Ulid, renter: Ulid, base: i64, slot: i64) -> Result<u64, tokio_postgres::Error> {
    let s = base + slot * HOUR;
    let e = s + HOUR - 1;
    client
        .execute(
            &format!(
                "INSERT INTO vehicle_assignments (vehicle_id, renter_org_id, start_at, end_at) \
                 VALUES ('{vid}', '{renter}', {s}, {e})"
            ),
            &[],
        )
        .await
}

async fn phase1_sequential_assignments(host: &str, port: u16) {
    let client = connect(host, port).await;
    let vid = register_vehicle(&client).await;
    let renter = Ulid::new();
    let base = now_ms() + DAY;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        assign_slot(&client, vid, renter, base, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} assignments in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent_rentals(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let vid = register_vehicle(&client).await;
            let renter = Ulid::new();
            let now = now_ms();
            client
                .batch_execute(&format!(
                    "INSERT INTO vehicle_assignments (vehicle_id, renter_org_id, start_at) \
                     VALUES ('{vid}', '{renter}', {})",
                    now - HOUR
                ))
                .await
                .unwrap();

            let base = now + DAY;
            for j in 0..n_per_task {
                let s = base + (j as i64) * 2 * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        "INSERT INTO rentals (organization_id, vehicle_id, planned_pickup_at, planned_return_at) \
                         VALUES ('{renter}', '{vid}', {s}, {e})"
                    ))
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
        "  {n_tasks} tasks x {n_per_task} rentals = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_conflict_lookup_under_load(host: &str, port: u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let vid = register_vehicle(&client).await;
            let renter = Ulid::new();
            let base = now_ms() + DAY;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = assign_slot(&client, vid, renter, base, i).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let lookups_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let vid = register_vehicle(&client).await;
            let renter = Ulid::new();
            let base = now_ms() + DAY;
            // Fill the calendar so lookups have something to walk
            for i in 0..50 {
                assign_slot(&client, vid, renter, base, i * 2).await.unwrap();
            }

            let mut latencies = Vec::with_capacity(lookups_per_reader);
            for p in 0..lookups_per_reader {
                let ws = base + (p as i64 % 100) * HOUR;
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM assignment_conflicts WHERE vehicle_id = '{vid}' \
                         AND window_start = {ws} AND window_end = {}",
                        ws + HOUR
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

    print_latency("conflict lookup", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let vid = register_vehicle(&client).await;
            let renter = Ulid::new();
            let base = now_ms() + DAY;
            for i in 0..ops_per_conn {
                assign_slot(&client, vid, renter, base, i).await.unwrap();
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
    let host = std::env::var("FLEETLINE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FLEETLINE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FLEETLINE_PORT");

    println!("=== fleetline stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenants (unique dbname) to avoid interference

    println!("[phase 1] sequential assignment throughput");
    phase1_sequential_assignments(&host, port).await;

    println!("\n[phase 2] concurrent rental throughput");
    phase2_concurrent_rentals(&host, port).await;

    println!("\n[phase 3] conflict lookup latency under write load");
    phase3_conflict_lookup_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
