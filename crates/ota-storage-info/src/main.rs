// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Prints a JSON summary of the OTA client storage.
//!
//! The store is opened readonly, so this can run next to the client. Setting
//! `OTA_STORAGE_ROLLBACK_TO=<version>` instead downgrades the database schema
//! for an older client build; that path needs the writer lock.

use std::env;
use std::process::ExitCode;

use serde_json::{json, Value};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ota_storage_core::{
    open_storage, rollback_database, RepositoryType, Role, SqlStorage, StorageConfig,
    StorageError,
};

const ENV_LOG_LEVEL: &str = "OTA_LOG_LEVEL";
const ENV_ROLLBACK_TO: &str = "OTA_STORAGE_ROLLBACK_TO";

fn main() -> ExitCode {
    let log_level = env::var(ENV_LOG_LEVEL)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("invalid {ENV_LOG_LEVEL}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {err}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = StorageConfig::from_os_env();
    let result = match env::var(ENV_ROLLBACK_TO) {
        Ok(version) => match version.trim().parse::<i64>() {
            Ok(target) => rollback(&config, target),
            Err(_) => {
                error!(value = %version, "{ENV_ROLLBACK_TO} must be an integer");
                return ExitCode::FAILURE;
            }
        },
        Err(_) => summarize(config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, fatal = err.is_fatal(), "storage inspection failed");
            ExitCode::FAILURE
        }
    }
}

fn rollback(config: &StorageConfig, target: i64) -> Result<(), StorageError> {
    rollback_database(config, target)?;
    info!(version = target, "database rolled back");
    Ok(())
}

fn summarize(config: StorageConfig) -> Result<(), StorageError> {
    let storage = open_storage(config, true)?;
    let summary = summary(&storage)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).map_err(StorageError::Serialization)?
    );
    Ok(())
}

fn summary(storage: &SqlStorage) -> Result<Value, StorageError> {
    let serials = storage.load_ecu_serials()?.unwrap_or_default();
    let mut ecus = Vec::with_capacity(serials.len());
    for (index, (serial, hardware_id)) in serials.iter().enumerate() {
        let (current, pending) = storage.load_installed_versions(serial)?;
        ecus.push(json!({
            "serial": serial,
            "hardware_id": hardware_id,
            "primary": index == 0,
            "current": current.map(|target| target.filename().to_string()),
            "pending": pending.map(|target| target.filename().to_string()),
        }));
    }

    let mut metadata = serde_json::Map::new();
    for repo in RepositoryType::all() {
        let mut roles = serde_json::Map::new();
        roles.insert("root".to_string(), json!(storage.latest_root_version(repo)?));
        for role in Role::non_root() {
            let present = storage.load_non_root(repo, role)?.is_some();
            roles.insert(role.name().to_string(), json!(present));
        }
        metadata.insert(repo.to_string(), Value::Object(roles));
    }

    let images: Vec<Value> = storage
        .get_target_files()?
        .into_iter()
        .map(|file| {
            json!({
                "filename": file.filename,
                "size": file.size,
                "hashes": file.hashes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();

    let misconfigured: Vec<Value> = storage
        .load_misconfigured_ecus()?
        .into_iter()
        .map(|ecu| json!({ "serial": ecu.serial, "hardware_id": ecu.hardware_id, "state": format!("{:?}", ecu.state) }))
        .collect();

    let installation = storage.load_device_installation_result()?.map(|result| {
        json!({
            "success": result.result.success,
            "result_code": result.result.result_code,
            "description": result.result.description,
            "correlation_id": result.correlation_id,
        })
    });

    Ok(json!({
        "storage": storage.config().path.display().to_string(),
        "schema_version": storage.schema_version()?.to_string(),
        "device_id": storage.load_device_id()?,
        "registered": storage.load_ecu_registered()?,
        "need_reboot": storage.load_need_reboot()?,
        "has_primary_keys": storage.load_primary_public()?.is_some(),
        "has_tls_credentials": storage.load_tls_creds()?.is_some(),
        "ecus": ecus,
        "misconfigured_ecus": misconfigured,
        "metadata": metadata,
        "images": images,
        "device_installation_result": installation,
        "report_counters": storage.load_ecu_report_counters()?,
    }))
}
