//! Many hosts at once
//!
//! Each host gets its own task and its own sessions; a semaphore caps how
//! many run at the same time. Results come back in input order.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Result for one host
#[derive(Debug)]
pub struct HostResult<T> {
    pub host: String,
    pub result: Result<T>,
}

impl<T> HostResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `job` for every host with at most `parallelism` in flight
pub async fn run_fleet<F, Fut, T>(
    hosts: Vec<String>,
    parallelism: usize,
    job: F,
) -> Vec<HostResult<T>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let job = Arc::new(job);
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    info!(
        "Running {} host(s), {} at a time",
        hosts.len(),
        parallelism.max(1)
    );

    let mut tasks = Vec::with_capacity(hosts.len());
    for host in hosts {
        let job = Arc::clone(&job);
        let semaphore = Arc::clone(&semaphore);
        let name = host.clone();
        let task = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            debug!("{}: job started", name);
            job(name).await
        });
        tasks.push((host, task));
    }

    join_all(tasks.into_iter().map(|(host, task)| async move {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::SessionFault {
                reason: format!("job for {} aborted: {}", host, e),
            }),
        };
        match &result {
            Ok(_) => info!("{}: done", host),
            Err(e) => warn!("{}: {}", host, e),
        }
        HostResult { host, result }
    }))
    .await
}
