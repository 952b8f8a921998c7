use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotledger::directory::{InMemoryCatalog, InMemoryDirectory};
use slotledger::engine::{Engine, EngineConfig};
use slotledger::model::{Activity, ActivityCategory, Role, Subject};
use slotledger::wire;

// ── Test infrastructure ──────────────────────────────────────

struct People {
    ana: Ulid,
    raj: Ulid,
    activity: Ulid,
}

fn subject(id: Ulid, name: &str, role: Role) -> Subject {
    Subject {
        id,
        name: name.into(),
        email: format!("{}@example.org", name.to_lowercase()),
        role,
        supervisor_id: None,
    }
}

async fn start_test_server() -> (SocketAddr, People) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let people = People {
        ana: Ulid::new(),
        raj: Ulid::new(),
        activity: Ulid::new(),
    };
    let directory = InMemoryDirectory::new();
    directory.insert(subject(people.ana, "Ana", Role::Sme));
    directory.insert(subject(people.raj, "Raj", Role::Sme));
    let catalog = InMemoryCatalog::new();
    catalog.insert(Activity {
        id: people.activity,
        name: "Onboarding".into(),
        category: ActivityCategory::CalendarTraining,
        duration_hours: Some(2.0),
        is_variable_duration: false,
    });

    let dir = std::env::temp_dir().join(format!("slotledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("slotledger.wal"),
            Arc::new(directory),
            Arc::new(catalog),
            EngineConfig::default(),
        )
        .unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "slotledger".to_string(), None)
                    .await;
            });
        }
    });

    (addr, people)
}

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotledger")
        .user(user)
        .password("slotledger");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

fn insert(subject_id: Ulid, activity_id: Ulid, from_time: &str, to_time: &str) -> String {
    format!(
        "INSERT INTO bookings (subject_id, from_date, to_date, from_time, to_time, activity_id, description) \
         VALUES ('{subject_id}', '2025-07-15', '2025-07-15', '{from_time}', '{to_time}', '{activity_id}', 'onboarding')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_then_conflict_is_rejected() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, &p.ana.to_string()).await;

    let created = rows(&client, &insert(p.ana, p.activity, "09:00", "11:00")).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("subject_id"), Some(p.ana.to_string().as_str()));
    assert_eq!(created[0].get("from_time"), Some("09:00:00"));

    let code = sqlstate(&client, &insert(p.ana, p.activity, "10:00", "12:00")).await;
    assert_eq!(code, "23P01");

    let code = sqlstate(&client, &insert(p.ana, p.activity, "12:00", "11:00")).await;
    assert_eq!(code, "22007");

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE subject_id = '{}'", p.ana)).await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn availability_reports_busy_and_free_subjects() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, &p.ana.to_string()).await;
    rows(&client, &insert(p.ana, p.activity, "09:00", "11:00")).await;

    let found = rows(
        &client,
        "SELECT * FROM availability WHERE date = '2025-07-15' AND from_time = '10:00' AND to_time = '10:30'",
    )
    .await;
    assert_eq!(found.len(), 2);
    let ana = found
        .iter()
        .find(|r| r.get("subject_id") == Some(p.ana.to_string().as_str()))
        .unwrap();
    assert_eq!(ana.get("available"), Some("f"));
    assert!(ana.get("conflicts").unwrap().contains("onboarding"));

    let free = rows(
        &client,
        "SELECT * FROM availability WHERE date = '2025-07-15' AND from_time = '10:00' AND to_time = '10:30' AND available = true",
    )
    .await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("subject_id"), Some(p.raj.to_string().as_str()));

    let probe = rows(
        &client,
        &format!(
            "SELECT * FROM conflicts WHERE subject_id = '{}' AND from_date = '2025-07-15' AND to_date = '2025-07-15' \
             AND from_time = '11:00' AND to_time = '12:00'",
            p.ana
        ),
    )
    .await;
    assert_eq!(probe[0].get("has_conflict"), Some("t"));
}

#[tokio::test]
async fn bulk_insert_reports_each_item() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, &p.ana.to_string()).await;

    let sql = format!(
        "INSERT INTO bookings (subject_id, from_date, to_date, from_time, to_time, activity_id, description) VALUES \
         ('{ana}', '2025-07-16', '2025-07-16', '09:00', '10:00', '{act}', 'one'), \
         ('{raj}', '2025-07-16', '2025-07-16', '09:00', '10:00', '{act}', 'not mine'), \
         ('{ana}', '2025-07-16', '2025-07-16', '09:30', '10:30', '{act}', 'overlaps one') \
         ON CONFLICT DO NOTHING",
        ana = p.ana,
        raj = p.raj,
        act = p.activity,
    );
    let outcome = rows(&client, &sql).await;
    let statuses: Vec<_> = outcome.iter().map(|r| r.get("status").unwrap().to_string()).collect();
    assert_eq!(statuses, ["created", "failed", "failed"]);
    assert!(outcome[0].get("booking_id").is_some());
    assert!(outcome[1].get("message").unwrap().contains("calling subject"));
    assert_eq!(outcome[0].get("request"), None);
    let echoed = outcome[1].get("request").unwrap();
    assert!(echoed.contains("not mine"));
    assert!(echoed.contains(&p.raj.to_string()));

    let strict = sql.replace(" ON CONFLICT DO NOTHING", "");
    assert_eq!(sqlstate(&client, &strict).await, "23514");
}

#[tokio::test]
async fn bulk_insert_needs_a_subject_login() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, "reporting").await;
    let sql = format!("{} ON CONFLICT DO NOTHING", insert(p.ana, p.activity, "09:00", "10:00"));
    assert_eq!(sqlstate(&client, &sql).await, "28000");
}

#[tokio::test]
async fn effort_rolls_up_over_the_wire() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, &p.ana.to_string()).await;
    rows(&client, &insert(p.ana, p.activity, "09:00", "11:30")).await;

    let totals = rows(
        &client,
        &format!("SELECT * FROM effort_totals WHERE subject_id = '{}' AND month = '2025-07'", p.ana),
    )
    .await;
    assert_eq!(totals[0].get("total_hours"), Some("2.5"));

    let active = rows(&client, "SELECT * FROM active_subjects WHERE month = '2025-07'").await;
    assert_eq!(active.len(), 1);

    let report = rows(&client, "SELECT * FROM effort_report WHERE month = '2025-07'").await;
    assert_eq!(report.len(), 2);
    let ana = report
        .iter()
        .find(|r| r.get("subject_id") == Some(p.ana.to_string().as_str()))
        .unwrap();
    assert_eq!(ana.get("total_sessions"), Some("1"));
    assert!(ana.get("sessions_by_category").unwrap().contains("\"CALENDAR_TRAINING\":1"));
}

#[tokio::test]
async fn update_and_delete_round_trip() {
    let (addr, p) = start_test_server().await;
    let client = connect(addr, &p.ana.to_string()).await;
    let created = rows(&client, &insert(p.ana, p.activity, "09:00", "10:00")).await;
    let id = created[0].get("id").unwrap().to_string();

    let updated = rows(
        &client,
        &format!("UPDATE bookings SET to_time = '10:45', description = 'longer' WHERE id = '{id}'"),
    )
    .await;
    assert_eq!(updated[0].get("to_time"), Some("10:45:00"));
    assert_eq!(updated[0].get("description"), Some("longer"));

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM bookings WHERE id = '{id}'")).await,
        "02000"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM rooms").await, "42601");
}
