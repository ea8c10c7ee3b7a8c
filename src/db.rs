//! Database connection management
//!
//! Builds the connection pool with explicit timeouts and TLS when required.
//! The reconciler checks out a single session from it for the whole run.

pub mod queries;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, TimeoutConfig};
use crate::error::{ReconcileError, ReconcileResult};

/// Server-side session settings applied to every connection
pub fn session_options(timeouts: &TimeoutConfig) -> String {
    format!(
        "-c statement_timeout={} -c lock_timeout={} -c application_name=schema-reconciler",
        timeouts.statement.as_millis(),
        timeouts.lock.as_millis()
    )
}

/// Create a connection pool with given configuration
pub fn create_pool(database: &DatabaseConfig, timeouts: &TimeoutConfig) -> ReconcileResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(database.host.clone());
    cfg.port = Some(database.port);
    cfg.user = Some(database.user.clone());
    cfg.password = Some(database.password.clone());
    cfg.dbname = Some(database.database.clone());
    cfg.connect_timeout = Some(timeouts.connect);
    cfg.options = Some(session_options(timeouts));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_config = PoolConfig::new(database.max_pool_size.max(1));
    pool_config.timeouts = Timeouts {
        wait: Some(timeouts.pool_wait),
        create: Some(timeouts.connect),
        recycle: Some(timeouts.connect),
    };
    cfg.pool = Some(pool_config);

    let pool = if database.use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
    }
    .map_err(|e| ReconcileError::Config(format!("Failed to create pool: {}", e)))?;

    debug!(
        target = %database.to_display_string(),
        tls = database.use_tls,
        "Connection pool configured"
    );
    Ok(pool)
}

/// Check out a session and verify the server answers
pub async fn checkout(pool: &Pool) -> ReconcileResult<deadpool_postgres::Object> {
    let client = pool.get().await?;
    client.query_one(queries::PING, &[]).await?;
    info!("Database connection established");
    Ok(client)
}
