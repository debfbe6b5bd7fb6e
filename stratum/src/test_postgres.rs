//! PostgreSQL test infrastructure.
//!
//! One container is shared by every test in the run; each test gets its own database.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

struct Shared {
    port: u16,
    // keeps the container and the runtime that manages it alive for the whole run
    _container: ContainerAsync<Postgres>,
    _rt: tokio::runtime::Runtime,
}

static POSTGRES: OnceLock<Shared> = OnceLock::new();

fn postgres_port() -> u16 {
    POSTGRES
        .get_or_init(|| {
            let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let (container, port) = rt.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                (container, port)
            });
            Shared {
                port,
                _container: container,
                _rt: rt,
            }
        })
        .port
}

fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create a fresh database with a unique name and return its URL.
pub fn fresh_postgres_url() -> String {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", db_name))
        .expect("failed to create test database");
    url_with_db(&db_name)
}
