//! Testcontainer setup for PostgreSQL.
//!
//! Set `PIPELINE_TEST_POSTGRES_HOST` (plus optional `_PORT`, `_USER`,
//! `_PASSWORD`) to run against an existing server instead of Docker.

use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use storage::RelationalConfig;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use uuid::Uuid;

const TEST_DATABASE: &str = "enrichment_test";

/// Handle for a PostgreSQL server used by a test.
pub struct TestPostgres {
    #[allow(dead_code)]
    container: Option<ContainerAsync<GenericImage>>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl TestPostgres {
    /// Uses the configured server or starts a container.
    pub async fn start() -> Self {
        if let Some(host) = std::env::var("PIPELINE_TEST_POSTGRES_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            return Self {
                container: None,
                host,
                port: std::env::var("PIPELINE_TEST_POSTGRES_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                user: std::env::var("PIPELINE_TEST_POSTGRES_USER")
                    .unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("PIPELINE_TEST_POSTGRES_PASSWORD").ok(),
            };
        }

        let (container, port) = start_postgres().await;
        Self {
            container: Some(container),
            host: "127.0.0.1".to_string(),
            port,
            user: "postgres".to_string(),
            password: Some("postgres".to_string()),
        }
    }

    /// Backend config pointing at a fresh table, so tests never share rows.
    pub fn relational_config(&self) -> RelationalConfig {
        RelationalConfig {
            host: self.host.clone(),
            port: self.port,
            dbname: TEST_DATABASE.to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            table_name: format!("articles_{}", Uuid::new_v4().simple()),
            min_connections: 1,
            max_connections: 5,
            acquire_timeout_secs: 10,
        }
    }
}

/// Start a PostgreSQL container, return it with its mapped port.
pub async fn start_postgres() -> (ContainerAsync<GenericImage>, u16) {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_exposed_port(5432.tcp())
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await.expect("Failed to start PostgreSQL");
    let port = container.get_host_port_ipv4(5432).await.unwrap();

    // The entrypoint restarts the server once after init.
    wait_for_postgres(port, Duration::from_secs(30)).await;

    (container, port)
}

async fn wait_for_postgres(port: u16, timeout: Duration) {
    let options = PgConnectOptions::new()
        .host("127.0.0.1")
        .port(port)
        .username("postgres")
        .password("postgres")
        .database("postgres");
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if let Ok(conn) = options.connect().await {
            conn.close().await.ok();
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("PostgreSQL on port {} not ready after {:?}", port, timeout);
}
