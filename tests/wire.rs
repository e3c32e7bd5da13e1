use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use bookd::config::Config;
use bookd::tenant::TenantManager;
use bookd::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "bookd";

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bookd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = Config {
        data_dir: dir,
        ..Config::default()
    };
    let tm = Arc::new(TenantManager::new(&config));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, org: &str) -> Client {
    let mut config = PgConfig::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(org)
        .user("bookd")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn create_room(client: &Client, capacity: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, capacity) VALUES ('{rid}', 'room', {capacity})"
        ))
        .await
        .unwrap();
    rid
}

fn booking_sql(id: Ulid, rid: Ulid, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{id}', '{rid}', {start}, {end})"#)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn resource_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;

    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, capacity, description) VALUES ('{rid}', 'Room A', 4, 'second floor')"
        ))
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM resources WHERE id = '{rid}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some("Room A"));
    assert_eq!(found[0].get("capacity"), Some("4"));
    assert_eq!(found[0].get("description"), Some("second floor"));
    assert_eq!(found[0].get("total"), Some("1"));
}

#[tokio::test]
async fn resource_schedule_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;

    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO resources (id, name, timezone, slots) VALUES ('{rid}', 'Desk', 'UTC+05:30', '[{{"day": "tuesday", "start": "09:00", "end": "12:00"}}]')"#
        ))
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM resources WHERE id = '{rid}'")).await;
    assert_eq!(found[0].get("timezone"), Some("UTC+05:30"));
    let slots: serde_json::Value = serde_json::from_str(found[0].get("slots").unwrap()).unwrap();
    assert_eq!(slots[0]["day"], "tuesday");
    assert_eq!(slots[0]["start"], "09:00");
    assert_eq!(slots[0]["end"], "12:00");

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO resources (id, slots) VALUES ('{}', '[{{"day": "monday", "start": "12:00", "end": "09:00"}}]')"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn booking_conflict_maps_to_exclusion_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "1").await;

    client
        .batch_execute(&booking_sql(Ulid::new(), rid, 36_000_000, 39_600_000))
        .await
        .unwrap();

    // Touching at 11:00 counts as overlap for closed spans.
    let err = client
        .batch_execute(&booking_sql(Ulid::new(), rid, 39_600_000, 43_200_000))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = client
        .batch_execute(&booking_sql(Ulid::new(), Ulid::new(), 0, 10))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn unavailability_blocks_bookings() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "NULL").await;

    let uid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO unavailabilities (id, resource_id, start, "end") VALUES ('{uid}', '{rid}', 1000, 2000)"#
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&booking_sql(Ulid::new(), rid, 1500, 2500))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let listed = rows(&client, &format!("SELECT * FROM unavailabilities WHERE resource_id = '{rid}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("start"), Some("1000"));
}

#[tokio::test]
async fn upsert_updates_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "1").await;

    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, resource_id, start, "end", status, metadata) VALUES ('{bid}', '{rid}', 1000, 2000, 'pending', '{{"customer": "ada"}}')"#
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, start, "end", status) VALUES ('{bid}', 1500, 2500, 'confirmed') ON CONFLICT (id) DO UPDATE SET start = EXCLUDED.start"#
        ))
        .await
        .unwrap();

    let found = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{bid}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("start"), Some("1500"));
    assert_eq!(found[0].get("end"), Some("2500"));
    assert_eq!(found[0].get("status"), Some("confirmed"));
    let metadata: serde_json::Value =
        serde_json::from_str(found[0].get("metadata").unwrap()).unwrap();
    assert_eq!(metadata["customer"], "ada");
}

#[tokio::test]
async fn availability_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "1").await;

    client
        .batch_execute(&booking_sql(Ulid::new(), rid, 100, 200))
        .await
        .unwrap();

    let free = rows(
        &client,
        &format!(r#"SELECT * FROM availability WHERE resource_id = '{rid}' AND start >= 0 AND "end" <= 1000"#),
    )
    .await;
    let spans: Vec<(String, String)> = free
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        spans,
        vec![
            ("0".to_string(), "99".to_string()),
            ("201".to_string(), "1000".to_string()),
        ]
    );
}

#[tokio::test]
async fn pagination_pseudo_columns() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "NULL").await;

    for i in 0..5 {
        client
            .batch_execute(&booking_sql(Ulid::new(), rid, i * 100, i * 100 + 50))
            .await
            .unwrap();
    }

    let page = rows(
        &client,
        &format!(r#"SELECT * FROM bookings WHERE resource_id = '{rid}' AND "limit" = 2 AND "offset" = 1"#),
    )
    .await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].get("start"), Some("100"));
    assert_eq!(page[1].get("start"), Some("200"));
    assert_eq!(page[0].get("total"), Some("5"));
}

#[tokio::test]
async fn organizations_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let acme = connect(addr, "acme").await;
    let globex = connect(addr, "globex").await;

    let rid = create_room(&acme, "1").await;
    let listed = rows(&globex, &format!("SELECT * FROM resources WHERE id = '{rid}'")).await;
    assert!(listed.is_empty());

    let err = globex
        .batch_execute(&booking_sql(Ulid::new(), rid, 0, 10))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn delete_resource_with_bookings_is_refused() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;
    let rid = create_room(&client, "1").await;
    let bid = Ulid::new();
    client
        .batch_execute(&booking_sql(bid, rid, 0, 10))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23503"));

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{rid}'"))
        .await
        .unwrap();
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "acme").await;

    let err = client.batch_execute("INSERT INTO").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client
        .batch_execute("SELECT * FROM invoices")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42P01"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_respect_capacity() {
    let (addr, _tm) = start_test_server().await;
    let setup = connect(addr, "acme").await;
    let rid = create_room(&setup, "2").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, "acme").await;
            client
                .batch_execute(&booking_sql(Ulid::new(), rid, 1000, 2000))
                .await
                .is_ok()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 2);

    let listed = rows(&setup, &format!("SELECT * FROM bookings WHERE resource_id = '{rid}'")).await;
    assert_eq!(listed.len(), 2);
}
