use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use rentd::config::PageLimits;
use rentd::tenant::TenantManager;
use rentd::wire;

const PASSWORD: &str = "rentd";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, PageLimits::default()));

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

async fn connect_as(addr: SocketAddr, db: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
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
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().unwrap();
    err.as_db_error().unwrap().code().code().to_string()
}

async fn insert_item(client: &Client, total_stock: u32, price_per_day: i64) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO items (id, name, price_per_day, total_stock) VALUES ('{id}', 'Tent', {price_per_day}, {total_stock})"
        ))
        .await
        .unwrap();
    id
}

fn rental_sql(id: Ulid, item: Ulid, start: &str, end: &str, quantity: u32) -> String {
    format!(
        "INSERT INTO rentals (id, item_id, start_date, end_date, quantity) \
         VALUES ('{id}', '{item}', '{start}', '{end}', {quantity})"
    )
}

async fn insert_rental(client: &Client, item: Ulid, start: &str, end: &str, quantity: u32) -> Ulid {
    let id = Ulid::new();
    client.batch_execute(&rental_sql(id, item, start, end, quantity)).await.unwrap();
    id
}

async fn real_available(client: &Client, item: Ulid, start: &str, end: &str) -> i64 {
    let sql = format!(
        r#"SELECT * FROM availability WHERE item_id = '{item}' AND start >= '{start}' AND "end" <= '{end}'"#
    );
    let rows = rows(client, &sql).await;
    assert_eq!(rows.len(), 1);
    rows[0].get("real_available_stock").unwrap().parse().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "shop", "olivia").await;

    let rows = rows(&client, "SELECT * FROM items").await;
    assert!(rows.is_empty());
}

#[tokio::test]
async fn rental_flow_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "shop", "olivia").await;
    let renter = connect_as(addr, "shop", "ravi").await;

    let item = insert_item(&owner, 5, 10).await;

    let a = insert_rental(&renter, item, "2024-01-01", "2024-01-10", 3).await;
    let conflict = rental_sql(Ulid::new(), item, "2024-01-05", "2024-01-07", 3);
    assert_eq!(sqlstate(&renter, &conflict).await, "23P01");
    insert_rental(&renter, item, "2024-01-05", "2024-01-07", 2).await;
    assert_eq!(real_available(&owner, item, "2024-01-05", "2024-01-07").await, 0);

    let row = &rows(&renter, &format!("SELECT * FROM rentals WHERE id = '{a}'")).await[0];
    assert_eq!(row.get("start_date"), Some("2024-01-01"));
    assert_eq!(row.get("end_date"), Some("2024-01-10"));
    assert_eq!(row.get("total_price"), Some("300"));
    assert_eq!(row.get("is_active"), Some("t"));
    assert_eq!(row.get("renter_id"), Some("ravi"));

    renter
        .batch_execute(&format!("UPDATE rentals SET is_active = false WHERE id = '{a}'"))
        .await
        .unwrap();
    assert_eq!(real_available(&owner, item, "2024-01-05", "2024-01-07").await, 3);

    let again = format!("UPDATE rentals SET is_active = false WHERE id = '{a}'");
    assert_eq!(sqlstate(&renter, &again).await, "55000");

    insert_rental(&renter, item, "2024-01-05", "2024-01-07", 3).await;
}

#[tokio::test]
async fn identity_comes_from_login_user() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "shop", "olivia").await;
    let renter = connect_as(addr, "shop", "ravi").await;
    let stranger = connect_as(addr, "shop", "mallory").await;

    let item = insert_item(&owner, 2, 10).await;
    let row = &rows(&owner, &format!("SELECT * FROM items WHERE id = '{item}'")).await[0];
    assert_eq!(row.get("owner_id"), Some("olivia"));
    assert_eq!(row.get("real_available_stock"), None);

    let rename = format!("UPDATE items SET name = 'Mine' WHERE id = '{item}'");
    assert_eq!(sqlstate(&renter, &rename).await, "42501");

    let rental = insert_rental(&renter, item, "2024-03-01", "2024-03-02", 1).await;
    let peek = format!("SELECT * FROM rentals WHERE id = '{rental}'");
    assert_eq!(sqlstate(&stranger, &peek).await, "P0002");
    assert_eq!(rows(&owner, &peek).await.len(), 1);

    let confirm = format!("UPDATE rentals SET owner_received = true WHERE id = '{rental}'");
    assert_eq!(sqlstate(&renter, &confirm).await, "42501");
    owner.batch_execute(&confirm).await.unwrap();

    let row = &rows(&renter, &peek).await[0];
    assert_eq!(row.get("is_active"), Some("f"));
    assert_eq!(row.get("owner_received"), Some("t"));

    assert!(rows(&renter, "SELECT * FROM rentals").await.is_empty());
}

#[tokio::test]
async fn item_listing_with_window_and_paging() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "shop", "olivia").await;
    let renter = connect_as(addr, "shop", "ravi").await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(insert_item(&owner, 4, 10).await);
    }
    ids.sort();
    insert_rental(&renter, ids[0], "2024-01-01", "2024-01-10", 3).await;

    let sql = r#"SELECT * FROM items WHERE start >= '2024-01-05' AND "end" <= '2024-01-07' LIMIT 2 OFFSET 0"#;
    let page = rows(&owner, sql).await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].get("id"), Some(ids[0].to_string().as_str()));
    assert_eq!(page[0].get("real_available_stock"), Some("1"));
    assert_eq!(page[1].get("real_available_stock"), Some("4"));
    // The stored counter is reported alongside, and unchanged by listing.
    assert_eq!(page[0].get("available_stock"), Some("1"));

    let page = rows(&owner, "SELECT * FROM items LIMIT 10 OFFSET 3").await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[1].get("id"), Some(ids[4].to_string().as_str()));

    let reversed = r#"SELECT * FROM items WHERE start >= '2024-02-01' AND "end" <= '2024-01-01'"#;
    assert_eq!(sqlstate(&owner, reversed).await, "22023");
}

#[tokio::test]
async fn item_lifecycle_errors() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "shop", "olivia").await;
    let renter = connect_as(addr, "shop", "ravi").await;

    let item = insert_item(&owner, 1, 10).await;
    let dup = format!("INSERT INTO items (id, name, price_per_day, total_stock) VALUES ('{item}', 'Tent', 1, 1)");
    assert_eq!(sqlstate(&owner, &dup).await, "23505");

    let bad = format!(
        "INSERT INTO items (id, name, price_per_day, total_stock, available_stock) VALUES ('{}', 'Tent', 1, 1, 2)",
        Ulid::new()
    );
    assert_eq!(sqlstate(&owner, &bad).await, "22023");

    let zero = rental_sql(Ulid::new(), item, "2024-01-01", "2024-01-03", 0);
    assert_eq!(sqlstate(&renter, &zero).await, "22023");
    let same_day = rental_sql(Ulid::new(), item, "2024-01-03", "2024-01-03", 1);
    assert_eq!(sqlstate(&renter, &same_day).await, "22023");
    let missing = rental_sql(Ulid::new(), Ulid::new(), "2024-01-01", "2024-01-03", 1);
    assert_eq!(sqlstate(&renter, &missing).await, "P0002");

    let rental = insert_rental(&renter, item, "2024-01-01", "2024-01-03", 1).await;
    let delete = format!("DELETE FROM items WHERE id = '{item}'");
    assert_eq!(sqlstate(&owner, &delete).await, "23503");

    renter
        .batch_execute(&format!("UPDATE rentals SET is_active = false WHERE id = '{rental}'"))
        .await
        .unwrap();
    owner.batch_execute(&delete).await.unwrap();
    assert_eq!(sqlstate(&owner, &format!("SELECT * FROM items WHERE id = '{item}'")).await, "P0002");

    assert_eq!(sqlstate(&owner, "SELECT * FROM bookings").await, "42601");
}

#[tokio::test]
async fn ignored_filters_are_errors_not_wider_results() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "shop", "olivia").await;
    let renter = connect_as(addr, "shop", "ravi").await;

    let tent = insert_item(&owner, 2, 10).await;
    let stove = insert_item(&owner, 2, 10).await;
    insert_rental(&renter, tent, "2024-01-01", "2024-01-03", 1).await;
    insert_rental(&renter, stove, "2024-01-01", "2024-01-03", 1).await;

    let by_item = format!("SELECT * FROM rentals WHERE item_id = '{tent}'");
    assert_eq!(sqlstate(&renter, &by_item).await, "42601");
    let by_window = "SELECT * FROM rentals WHERE start >= '2024-02-01'";
    assert_eq!(sqlstate(&renter, by_window).await, "42601");
    assert_eq!(sqlstate(&renter, "SELECT * FROM rentals LIMIT 1").await, "42601");
    let paged = format!("SELECT * FROM availability WHERE item_id = '{tent}' LIMIT 1");
    assert_eq!(sqlstate(&owner, &paged).await, "42601");

    assert_eq!(rows(&renter, "SELECT * FROM rentals").await.len(), 2);
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let shop_a = connect_as(addr, "shop_a", "olivia").await;
    let shop_b = connect_as(addr, "shop_b", "olivia").await;

    let item = insert_item(&shop_a, 1, 10).await;
    assert_eq!(rows(&shop_a, "SELECT * FROM items").await.len(), 1);
    assert!(rows(&shop_b, "SELECT * FROM items").await.is_empty());

    let engine = tm.get_or_create("shop_a").unwrap();
    assert_eq!(engine.get_item(item).await.unwrap().owner_id, "olivia");
}
