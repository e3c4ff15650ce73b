use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use tracing::{error, info};

use bootstrap::{BootstrapConverter, MySqlDumpParser, PgDumpParser};
use buffer::ChangeBuffer;
use common::cancel::{cancel_pair, CancelToken};
use common::config::KashoConfig;
use common::err::{KResult, KashoError};
use dialect::dialect_for;
use stream::capture::{MySqlReplicationDriver, PostgresReplicationDriver, ReplicationDriver};
use stream::rpc::RpcClient;
use stream::{ChangeStreamServer, ServerOptions};
use translicator::applier::{ApplierOptions, Translicator};
use translicator::replica::{MySqlReplicaWriter, PgReplicaWriter, ReplicaWriter};
use translicator::TransformEngine;

/// Ctrl-C wired to a cancel token.
fn shutdown_token() -> CancelToken {
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        handle.cancel();
    });
    token
}

pub async fn run_stream(config: KashoConfig) -> KResult<()> {
    let buffer = ChangeBuffer::connect(&config.buffer_url, &config.buffer).await?;
    let store = buffer.state_store();
    let options = ServerOptions {
        bind: config.rpc_bind.clone(),
        batch_size: config.batch_size,
        retry: config.retry.clone(),
    };

    match config.dialect.as_str() {
        "postgresql" | "postgres" => {
            let driver = PostgresReplicationDriver::new(&config.primary_url, &config.slot_name)?;
            serve(store, buffer, driver, options).await
        }
        "mysql" => {
            let driver = MySqlReplicationDriver::new(&config.primary_url, config.server_id);
            serve(store, buffer, driver, options).await
        }
        other => Err(KashoError::Config(format!("unknown dialect: {}", other))),
    }
}

async fn serve<D>(
    store: buffer::RedisStateStore,
    buffer: ChangeBuffer,
    driver: D,
    options: ServerOptions,
) -> KResult<()>
where
    D: ReplicationDriver + 'static,
{
    let server = ChangeStreamServer::new(store, buffer, driver, options).await?;
    let result = server.run(shutdown_token()).await;
    if let Err(e) = &result {
        error!("change-stream service failed: {}", e);
    }
    result
}

pub async fn run_apply(config: KashoConfig) -> KResult<()> {
    let dialect = dialect_for(&config.dialect)?;
    let buffer = ChangeBuffer::connect(&config.buffer_url, &config.buffer).await?;
    let state = buffer.state_store();

    let transforms = match &config.transform_rules {
        Some(path) => TransformEngine::load(path)?,
        None => TransformEngine::empty(),
    };
    if transforms.is_empty() {
        info!("no transform rules loaded; rows pass through unchanged");
    }

    let options = ApplierOptions {
        batch_size: config.batch_size,
        flush_interval: Duration::from_secs(config.checkpoint_flush_secs),
        skip_transform_errors: config.transform_skip_errors,
        retry: config.retry.clone(),
    };

    match config.dialect.as_str() {
        "postgresql" | "postgres" => {
            let writer = PgReplicaWriter::connect(&config.replica_url, dialect.as_ref()).await?;
            apply(buffer, state, writer, dialect, transforms, options).await
        }
        "mysql" => {
            let writer = MySqlReplicaWriter::connect(&config.replica_url, dialect.as_ref()).await?;
            apply(buffer, state, writer, dialect, transforms, options).await
        }
        other => Err(KashoError::Config(format!("unknown dialect: {}", other))),
    }
}

async fn apply<W>(
    buffer: ChangeBuffer,
    state: buffer::RedisStateStore,
    writer: W,
    dialect: std::sync::Arc<dyn dialect::Dialect>,
    transforms: TransformEngine,
    options: ApplierOptions,
) -> KResult<()>
where
    W: ReplicaWriter,
{
    let mut translicator = Translicator::new(buffer, state, writer, dialect, transforms, options);
    let result = translicator.run(shutdown_token()).await;
    info!(applied = translicator.applied(), checkpoint = ?translicator.checkpoint(),
        "translicator stopped");
    result
}

pub async fn run_convert(config: KashoConfig, dump: &Path) -> KResult<()> {
    let mut buffer = ChangeBuffer::connect(&config.buffer_url, &config.buffer).await?;
    let file = File::open(dump)
        .map_err(|e| KashoError::Config(format!("{}: {}", dump.display(), e)))?;
    let reader = BufReader::new(file);

    let database = dialect_for(&config.dialect)?
        .shape_dsn(&config.primary_url)?
        .database;
    let mut converter = BootstrapConverter::new(&mut buffer, database);

    let result = match config.dialect.as_str() {
        "postgresql" | "postgres" => {
            converter
                .run(PgDumpParser::new(reader, config.bootstrap_row_cap))
                .await
        }
        "mysql" => {
            converter
                .run(MySqlDumpParser::new(reader, config.bootstrap_row_cap))
                .await
        }
        other => return Err(KashoError::Config(format!("unknown dialect: {}", other))),
    };

    match result {
        Ok(report) => {
            eprintln!(
                "converted {} changes ({} .. {})",
                report.changes,
                report.first_position.as_deref().unwrap_or("-"),
                report.last_position.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
        Err(e) => {
            let report = converter.report();
            eprintln!(
                "conversion FAILED after {} changes ({} .. {}); delete that range and retry",
                report.changes,
                report.first_position.as_deref().unwrap_or("-"),
                report.last_position.as_deref().unwrap_or("-"),
            );
            Err(e)
        }
    }
}

pub async fn ctl_start_bootstrap(config: &KashoConfig, start_position: &str) -> KResult<()> {
    let mut client = RpcClient::connect(&config.rpc_bind).await?;
    let reply = client.start_bootstrap(start_position).await?;
    eprintln!(
        "{} -> {} (ready_to_stream: {})",
        reply.prev, reply.curr, reply.ready_to_stream
    );
    Ok(())
}

pub async fn ctl_complete_bootstrap(config: &KashoConfig) -> KResult<()> {
    let mut client = RpcClient::connect(&config.rpc_bind).await?;
    let reply = client.complete_bootstrap().await?;
    eprintln!(
        "{} -> {} (ready_to_stream: {})",
        reply.prev, reply.curr, reply.ready_to_stream
    );
    Ok(())
}

pub async fn ctl_reset(config: &KashoConfig) -> KResult<()> {
    let mut client = RpcClient::connect(&config.rpc_bind).await?;
    let reply = client.reset().await?;
    eprintln!("{} -> {}", reply.prev, reply.curr);
    Ok(())
}

pub async fn ctl_tail(config: &KashoConfig, from_position: &str) -> KResult<()> {
    let client = RpcClient::connect(&config.rpc_bind).await?;
    let mut changes = client.stream_changes(from_position).await?;
    while let Some(change) = changes.next_change().await? {
        println!("{}", change.to_json()?);
    }
    Ok(())
}

pub async fn ctl_status(config: &KashoConfig) -> KResult<()> {
    let mut client = RpcClient::connect(&config.rpc_bind).await?;
    let status = client.status().await?;
    eprintln!("state:              {}", status.state);
    eprintln!("start_position:     {}", status.start_position);
    eprintln!("current_position:   {}", status.current_position);
    eprintln!("accumulated_count:  {}", status.accumulated_count);
    eprintln!("connected_clients:  {}", status.connected_clients);
    eprintln!("uptime_seconds:     {}", status.uptime_seconds);
    Ok(())
}
