//! `skyq task show|delete|run`.

use anyhow::Result;
use serde_json::json;

use skyquery_core::models::Identity;

use crate::config::Config;
use crate::query::build_service;

pub async fn run_show(config: &Config, task_id: &str, user: &str) -> Result<()> {
    let (service, pool) = build_service(config).await?;
    let caller = Identity::new(user);
    let outcome = async {
        let task = service.task(task_id, &caller).await?;
        let result = service.task_result(task_id, &caller).await?;
        Ok::<_, anyhow::Error>(json!({ "task": task, "result": result }))
    }
    .await;
    pool.close().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

pub async fn run_delete(config: &Config, task_id: &str, user: &str) -> Result<()> {
    let (service, pool) = build_service(config).await?;
    let outcome = service.delete_task(task_id, &Identity::new(user)).await;
    pool.close().await;

    outcome?;
    println!("deleted {}", task_id);
    Ok(())
}

pub async fn run_enqueued(config: &Config, task_id: &str, user: &str) -> Result<()> {
    let (service, pool) = build_service(config).await?;
    let outcome = service.run_enqueued(task_id, &Identity::new(user)).await;
    pool.close().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}
